use env_logger::Target;
use std::fs;
use std::io;
use std::path::Path;

/// Initialise the global logger once.
///
/// Logs go to `log_file` when it can be opened for appending, otherwise to
/// stderr. `RUST_LOG` overrides the default `info` level.
pub fn init(log_file: Option<&Path>) {
    let target = log_file
        .and_then(|path| {
            (|| -> io::Result<Target> {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent)?;
                }
                let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
                Ok(Target::Pipe(Box::new(file)))
            })()
            .ok()
        })
        .unwrap_or(Target::Stderr);

    let _ = env_logger::Builder::new()
        .target(target)
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .try_init();
}
