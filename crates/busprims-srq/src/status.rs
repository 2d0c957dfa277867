/// Bit 6 of an IEEE-488 status byte: the device requested service.
pub const SRQ_BIT: u8 = 0x40;

/// Whether the status byte carries the service-request flag.
pub fn is_srq_asserted(status: u8) -> bool {
    status & SRQ_BIT != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn srq_bit_detection() {
        assert!(is_srq_asserted(0x40));
        assert!(is_srq_asserted(0x41));
        assert!(is_srq_asserted(0xFF));
        assert!(!is_srq_asserted(0x00));
        assert!(!is_srq_asserted(0x3F));
        assert!(!is_srq_asserted(0x80));
    }
}
