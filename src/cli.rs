//! Argument checks shared by the command line tools.
//!
//! Checks return a message on failure; binaries turn it into a clap usage error so that a bad
//! invocation exits the same way as a malformed argument.

use clap::error::ErrorKind;
use clap::CommandFactory;
use std::fs;
use std::path::Path;

pub type Check = std::result::Result<(), String>;

/// turns a failed check into a usage error of the command `A`
pub trait OrUsageExit<T> {
    fn or_usage_exit<A: CommandFactory>(self) -> T;
}

impl<T> OrUsageExit<T> for std::result::Result<T, String> {
    fn or_usage_exit<A: CommandFactory>(self) -> T {
        match self {
            Ok(v) => v,
            Err(msg) => A::command().error(ErrorKind::ValueValidation, msg).exit(),
        }
    }
}

/// logger for the binaries, `info` unless RUST_LOG says otherwise
pub fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

/// logs a pipeline failure and exits with status 1
pub fn exit_on_error(result: crate::Result<()>) {
    if let Err(e) = result {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

pub fn assert_inputs_exist(required: &[&Path], optional: &[Option<&Path>]) -> Check {
    for path in required.iter().copied().chain(optional.iter().flatten().copied()) {
        if !path.is_file() {
            return Err(format!("Input file {} does not exist", path.display()));
        }
    }
    Ok(())
}

/// outputs must not exist unless `overwrite` is set, and their parent directory must exist
pub fn assert_outputs_exist(outputs: &[&Path], overwrite: bool) -> Check {
    for path in outputs {
        if path.exists() && !overwrite {
            return Err(format!("Output file {} exists. Use -f to force overwriting", path.display()));
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                return Err(format!("Directory {} for a given output file does not exist", parent.display()));
            }
        }
    }
    Ok(())
}

/// creates the directory when missing. An existing directory must be empty unless `overwrite` is
/// set, in which case its content is removed.
pub fn assert_output_dir_exists_and_empty(dir: &Path, overwrite: bool) -> Check {
    if !dir.exists() {
        return fs::create_dir_all(dir).map_err(|e| format!("cannot create {}: {}", dir.display(), e));
    }
    if !dir.is_dir() {
        return Err(format!("{} is not a directory", dir.display()));
    }
    let mut entries = fs::read_dir(dir).map_err(|e| format!("cannot read {}: {}", dir.display(), e))?;
    if entries.next().is_none() {
        return Ok(());
    }
    if !overwrite {
        return Err(format!(
            "Output directory {} isn't empty and some files could be overwritten. Use -f option if you want to continue",
            dir.display()
        ));
    }
    fs::remove_dir_all(dir)
        .and_then(|_| fs::create_dir_all(dir))
        .map_err(|e| format!("cannot clear {}: {}", dir.display(), e))
}
