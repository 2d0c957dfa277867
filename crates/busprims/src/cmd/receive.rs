use crate::cmd::ReceiveArgs;
use crate::exit::{link_error, CliResult, SUCCESS};
use crate::output::{print_message, OutputFormat};

pub fn run(args: ReceiveArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = args.link.timeout()?;
    let mut link = args.link.open()?;

    for _ in 0..args.count {
        let message = link
            .receive(timeout)
            .map_err(|err| link_error("receive failed", err))?;
        print_message(link.address(), &message, format);
    }

    let _ = link.close();
    Ok(SUCCESS)
}
