use clap::Parser;
use std::path::PathBuf;
use tractometry::cli;
use tractometry::params::SimilarityParams;

#[derive(Debug, Parser)]
struct Args {
    /// path to similarity parameters file to write
    parameter_file: PathBuf,
}

fn main() {
    cli::init_logging();
    let args = Args::parse();
    match SimilarityParams::default().to_file(&args.parameter_file) {
        Ok(filename) => log::info!("wrote default parameter file to {}", filename.display()),
        Err(e) => cli::exit_on_error(Err(e)),
    }
}
