use std::process::ExitCode;
use std::sync::Arc;

use camino::Utf8PathBuf;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::{error, info};

use greylag::center::Center;
use greylag::config::Config;
use greylag::daemon::PidFile;
use greylag::server::{Listener, PolicyServer};
use greylag::{log, sweeper, whitelist};

fn main() -> ExitCode {
    // Set up the command-line interface.
    let cmd = clap::Command::new("greylagd")
        .version(env!("GREYLAG_BUILD_VERSION"))
        .about("A greylisting policy daemon for the Postfix SMTPD access policy protocol")
        .next_line_help(true)
        .arg(
            clap::Arg::new("config")
                .long("config")
                .short('c')
                .value_name("PATH")
                .default_value("/etc/greylag/config.toml")
                .help("The configuration file"),
        )
        .arg(
            clap::Arg::new("check_config")
                .long("check-config")
                .action(clap::ArgAction::SetTrue)
                .help("Check the configuration and exit"),
        );

    // Process command-line arguments.
    let matches = cmd.get_matches();

    // Construct the configuration.
    let path = Utf8PathBuf::from(
        matches
            .get_one::<String>("config")
            .expect("the option has a default"),
    );
    let config = match Config::load(&path) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("greylag couldn't be configured: {error}");
            return ExitCode::FAILURE;
        }
    };

    if matches.get_flag("check_config") {
        return ExitCode::SUCCESS;
    }

    // Activate the configured logging setup.
    if let Err(error) = log::setup(&config.daemon.logging) {
        eprintln!("greylag couldn't set up logging: {error}");
        return ExitCode::FAILURE;
    }

    // Set up an async runtime.
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            error!("Couldn't start Tokio: {error}");
            return ExitCode::FAILURE;
        }
    };

    // Enter the runtime.
    runtime.block_on(serve(config))
}

/// Bring the service up, watch for signals, and tear it down again.
async fn serve(config: Config) -> ExitCode {
    // Open the stores and load the whitelists.  A store that cannot be
    // opened is fatal.
    let center = match Center::connect(config).await {
        Ok(center) => center,
        Err(error) => {
            error!("A store could not be opened: {error}");
            return ExitCode::FAILURE;
        }
    };

    // Bind before writing the PID file, so a lost race for the listen
    // endpoint leaves nothing behind.
    let listener = match Listener::bind(&center.config.listen) {
        Ok(listener) => listener,
        Err(error) => {
            error!("{error}");
            return ExitCode::FAILURE;
        }
    };

    let pid_file = match &center.config.daemon.pid_file {
        Some(path) => match PidFile::create(path) {
            Ok(pid_file) => Some(pid_file),
            Err(error) => {
                error!("{error}");
                return ExitCode::FAILURE;
            }
        },
        None => None,
    };

    // Spawn the server and the sweeper.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(PolicyServer::new(center.clone(), listener).run(shutdown_rx.clone()));
    let sweeper = tokio::spawn(sweeper::run(center.clone(), shutdown_rx));

    let code = match watch_signals(&center).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(()) => ExitCode::FAILURE,
    };

    // Drain: stop accepting, let the workers finish, flush the stores.
    // SIGHUP is a no-op from here on; nobody is listening for it anymore.
    info!("Shutting down");
    let _ = shutdown_tx.send(true);
    let _ = server.await;
    let _ = sweeper.await;

    if let Some(pid_file) = pid_file {
        pid_file.remove();
    }

    code
}

/// Dispatch signals until one of them asks for shutdown.
async fn watch_signals(center: &Arc<Center>) -> Result<(), ()> {
    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(error) => {
            error!("Listening for SIGHUP failed: {error}");
            return Err(());
        }
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(error) => {
            error!("Listening for SIGTERM failed: {error}");
            return Err(());
        }
    };

    loop {
        tokio::select! {
            // Watch for CTRL-C (SIGINT).
            res = tokio::signal::ctrl_c() => {
                if let Err(error) = res {
                    error!("Listening for CTRL-C (SIGINT) failed: {error}");
                    return Err(());
                }
                info!("Received SIGINT");
                return Ok(());
            }

            _ = terminate.recv() => {
                info!("Received SIGTERM");
                return Ok(());
            }

            // A reload must not block request handling; it runs as its own
            // task and ends in a single atomic swap.
            _ = hangup.recv() => {
                info!("Received SIGHUP; reloading whitelists");
                tokio::spawn(whitelist::reload(center.clone()));
            }
        }
    }
}
