use std::fs;

use busprims_link::{Link, LinkError};
use bytes::Bytes;
use tracing::{info, warn};

use crate::cmd::SendArgs;
use crate::exit::{io_error, link_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_message, OutputFormat};

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = args.link.timeout()?;
    let message = resolve_message(&args)?;
    let mut link = args.link.open()?;

    let report = link
        .send(&message, timeout)
        .map_err(|err| link_error("send failed", err))?;
    if report.is_complete() {
        info!(link = %link.address(), bytes = report.written, "message sent");
    } else {
        warn!(
            link = %link.address(),
            written = report.written,
            expected = report.expected,
            "message only partially sent"
        );
    }

    if args.wait {
        let reply =
            wait_for_reply(&mut link, timeout).map_err(|err| link_error("receive failed", err))?;
        print_message(link.address(), &reply, format);
    }

    let _ = link.close();
    Ok(SUCCESS)
}

fn resolve_message(args: &SendArgs) -> CliResult<Vec<u8>> {
    let mut message = if let Some(data) = &args.data {
        data.as_bytes().to_vec()
    } else if let Some(path) = &args.file {
        fs::read(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err))?
    } else {
        return Err(CliError::new(USAGE, "one of --data or --file is required"));
    };
    message.extend_from_slice(args.eol.as_bytes());
    Ok(message)
}

/// A LAN server link may not have its handler yet; give it the same timeout
/// to connect before waiting for the reply.
fn wait_for_reply(link: &mut Link, timeout: std::time::Duration) -> Result<Bytes, LinkError> {
    match link.receive(timeout) {
        Err(LinkError::NotConnected) => {
            link.accept(timeout)?;
            link.receive(timeout)
        }
        other => other,
    }
}
