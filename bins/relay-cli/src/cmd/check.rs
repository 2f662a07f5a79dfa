use crate::config::{self, CheckArgs};
use crate::error::CliError;

pub fn run(args: CheckArgs) -> Result<(), CliError> {
    let config = config::load(Some(&args.config))?;
    println!("{} is valid", args.config);
    println!("{config:#?}");
    Ok(())
}
