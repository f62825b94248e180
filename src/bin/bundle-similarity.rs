use clap::Parser;
use tractometry::bundle_similarity::{bundle_similarity, BundleSimilarityArgs};
use tractometry::cli::{self, OrUsageExit};

fn main() {
    cli::init_logging();
    let args = BundleSimilarityArgs::parse();
    let n_threads = args.check().or_usage_exit::<BundleSimilarityArgs>();
    cli::exit_on_error(bundle_similarity(&args, n_threads));
}
