use clap::Parser;
use tractometry::cli::{self, OrUsageExit};
use tractometry::screenshot_dti::{screenshot_dti, ScreenshotDtiArgs};

fn main() {
    cli::init_logging();
    let args = ScreenshotDtiArgs::parse();
    args.check().or_usage_exit::<ScreenshotDtiArgs>();
    cli::exit_on_error(screenshot_dti(&args));
}
