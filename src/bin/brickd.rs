//! brickd CLI entry point. Grounded on `brickd_linux.py`'s `__main__` block
//! (`--version`/`--no-daemon` handling), translated to `clap`.

use std::fs::OpenOptions;
use std::io::Write;

use clap::Parser;

use brickd::config::Config;
use brickd::error::Error;

#[derive(Parser)]
#[command(name = "brickd", version, about = "USB-to-TCP bridge daemon for Tinkerforge-style brick stacks")]
struct Cli {
    /// Stay attached to the terminal instead of daemonizing.
    #[arg(long = "no-daemon")]
    no_daemon: bool,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    let config = Config::from_env();

    let mut pidfile = match open_pidfile(&config) {
        Ok(pidfile) => pidfile,
        Err(err) => {
            log::error!("{err}");
            std::process::exit(1);
        }
    };
    let mut pidfile_guard = match pidfile.try_write() {
        Ok(guard) => guard,
        Err(_) => {
            log::error!("{}", Error::PidfileLocked(config.pidfile().to_path_buf()));
            std::process::exit(1);
        }
    };
    let _ = pidfile_guard.set_len(0);
    let _ = write!(pidfile_guard, "{}", std::process::id());
    let _ = pidfile_guard.flush();

    if cli.no_daemon {
        log::info!("running in the foreground (--no-daemon)");
    } else {
        log::info!("daemonization is not performed by this build; running in the foreground");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            log::error!("failed to start async runtime: {err}");
            std::process::exit(1);
        }
    };

    let result = runtime.block_on(brickd::supervisor::run(config));
    drop(pidfile_guard);

    match result {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            log::error!("{err}");
            std::process::exit(1);
        }
    }
}

/// Open (creating if necessary) the pidfile, ready to be locked. Splitting
/// this from the actual `try_write()` keeps the `fd_lock::RwLock` alive in
/// `main`'s own stack frame for as long as the guard borrowed from it needs
/// to be.
fn open_pidfile(config: &Config) -> Result<fd_lock::RwLock<std::fs::File>, Error> {
    let path = config.pidfile().to_path_buf();
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(&path)
        .map_err(|_| Error::PidfileLocked(path))?;

    Ok(fd_lock::RwLock::new(file))
}
