use clap::Parser;
use tractometry::cli::{self, OrUsageExit};
use tractometry::endpoints_metric::{endpoints_metric, EndpointsMetricArgs};

fn main() {
    cli::init_logging();
    let args = EndpointsMetricArgs::parse();
    args.check().or_usage_exit::<EndpointsMetricArgs>();
    cli::exit_on_error(endpoints_metric(&args));
}
