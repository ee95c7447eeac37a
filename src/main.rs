use clap::Parser;

use myqueue::cli::{self, Cli};
use myqueue::workflow::WorkflowRegistry;
use myqueue::{mqlog_error, Error};

fn main() {
    let cli = Cli::parse();
    myqueue::log::init(cli.debug);

    if let Err(e) = cli::run(cli, &WorkflowRegistry::new()) {
        mqlog_error!("{}", e);
        eprintln!("Error: {}", e);
        if let Error::Locked { path, .. } = &e {
            eprintln!(
                "Another mq process holds the queue lock. If none is running, remove {}",
                path.display()
            );
        }
        std::process::exit(1);
    }
}
