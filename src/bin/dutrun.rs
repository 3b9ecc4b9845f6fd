use clap::Parser;
use dutrun::{
    cli::{self, Cli, Commands},
    logging::initialize_logger,
};
use log::{debug, LevelFilter};
use miette::Result;

fn main() -> Result<()> {
    miette::set_panic_hook();
    initialize_logger(LevelFilter::Info);

    // Attempt to parse any provided command-line arguments, or print the
    // help message and terminate if the invocation is not correct.
    let args = Cli::parse().subcommand;
    debug!("{:#?}", args);

    // Execute the correct action based on the provided subcommand and its
    // associated arguments.
    let code = match args {
        Commands::Run(args) => cli::run(args)?,
        Commands::ListPorts => {
            cli::list_ports()?;
            0
        }
        Commands::ListPlugins => {
            cli::list_plugins();
            0
        }
        Commands::ListSupervisors => {
            cli::list_supervisors();
            0
        }
    };

    std::process::exit(code)
}
