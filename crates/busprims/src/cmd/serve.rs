use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use busprims_link::{LinkAddress, LinkError, LinkOpener};
use tracing::{debug, info};

use crate::cmd::{load_config, ServeArgs};
use crate::exit::{link_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::{print_message, OutputFormat};

/// How long each wait lasts before the stop flag is checked again.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

pub fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let config = load_config(args.config.as_deref())?.with_accept_timeout(Duration::ZERO);
    let mut link = LinkOpener::new(config)
        .open(LinkAddress::Server { port: args.port })
        .map_err(|err| link_error("listen failed", err))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let mut printed = 0usize;
    while running.load(Ordering::SeqCst) {
        let message = match link.receive(POLL_INTERVAL) {
            Ok(message) => message,
            Err(LinkError::NotConnected) | Err(LinkError::ConnectionClosed) => {
                match link.accept(POLL_INTERVAL) {
                    Ok(peer) => info!(%peer, "handler connected"),
                    Err(err) if err.is_timeout() => {}
                    Err(err) => return Err(link_error("accept failed", err)),
                }
                continue;
            }
            Err(err) if err.is_timeout() => continue,
            Err(err) => return Err(link_error("receive failed", err)),
        };

        print_message(link.address(), &message, format);
        printed = printed.saturating_add(1);

        if args.echo {
            link.send(&message, POLL_INTERVAL)
                .map_err(|err| link_error("echo failed", err))?;
            debug!(bytes = message.len(), "echoed message");
        }

        if let Some(count) = args.count {
            if printed >= count {
                break;
            }
        }
    }

    let _ = link.close();
    Ok(SUCCESS)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
