use std::env;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use getopts::Options;
extern crate sentry;

use pdsdns::config::Config;
use pdsdns::dns::context::ServerContext;
use pdsdns::dns::responder::DnsResponder;
use pdsdns::logging::init_logging;
use pdsdns::store::{MemoryStore, RecordStore};
use pdsdns::verification::scheduler::VerificationScheduler;
use pdsdns::verification::VerificationEngine;

fn print_usage(program: &str, opts: Options) {
    let brief = format!("Usage: {} [options]", program);
    print!("{}", opts.usage(&brief));
}

fn fail(message: &str) -> ! {
    eprintln!("{}", message);
    process::exit(1);
}

fn init_sentry(dsn: &str) -> sentry::ClientInitGuard {
    let guard = sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    ));

    sentry::configure_scope(|scope| {
        scope.set_tag("service", "pdsdns");
        scope.set_tag("version", env!("CARGO_PKG_VERSION"));
    });

    std::panic::set_hook(Box::new(|panic_info| {
        sentry::integrations::panic::panic_handler(panic_info);

        eprintln!("PANIC: {}", panic_info);

        sentry::configure_scope(|scope| {
            scope.set_tag("event_type", "panic");

            if let Some(location) = panic_info.location() {
                scope.set_tag("panic_file", location.file());
                scope.set_tag("panic_line", &location.line().to_string());
            }
        });
    }));

    guard
}

fn open_store(config: &Config) -> Arc<MemoryStore> {
    match config.data_file {
        Some(ref path) => match MemoryStore::open(path) {
            Ok(store) => Arc::new(store),
            Err(e) => fail(&format!("Failed to open data file {}: {}", path.display(), e)),
        },
        None => {
            log::warn!("No data file configured, state is kept in memory only");
            Arc::new(MemoryStore::new())
        }
    }
}

/// Main entry point for the pdsdns TXT responder
fn main() {
    let args: Vec<String> = env::args().collect();
    let program = args[0].clone();

    let mut opts = Options::new();
    opts.optflag("h", "help", "print this help menu");
    opts.optopt("c", "config", "TOML configuration file", "FILE");
    opts.optopt("b", "bind", "Address to bind the DNS listeners to", "HOST");
    opts.optopt("p", "port", "Port for the DNS listeners", "PORT");
    opts.optopt("d", "data-file", "JSON data file shared with pdsdns-cli", "PATH");
    opts.optopt(
        "",
        "poll-interval",
        "Seconds between background verification attempts (0 disables)",
        "SECONDS",
    );
    opts.optflag("", "disable-udp", "Do not serve DNS over UDP");
    opts.optflag("", "disable-tcp", "Do not serve DNS over TCP");

    let opt_matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(f) => fail(&f.to_string()),
    };

    if opt_matches.opt_present("h") {
        print_usage(&program, opts);
        return;
    }

    let config_path = opt_matches.opt_str("c").map(PathBuf::from);
    let mut config = match Config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => fail(&format!("Failed to load configuration: {}", e)),
    };

    if let Some(host) = opt_matches.opt_str("b") {
        config.dns_host = host;
    }
    if let Some(port) = opt_matches.opt_str("p") {
        match port.parse() {
            Ok(port) => config.dns_port = port,
            Err(_) => fail(&format!("Invalid port: {}", port)),
        }
    }
    if let Some(path) = opt_matches.opt_str("d") {
        config.data_file = Some(PathBuf::from(path));
    }
    if let Some(interval) = opt_matches.opt_str("poll-interval") {
        match interval.parse() {
            Ok(secs) => config.verification_poll_interval = secs,
            Err(_) => fail(&format!("Invalid poll interval: {}", interval)),
        }
    }

    init_logging(&config.log_level, config.log_format);

    let sentry_guard = config.sentry_dsn.as_deref().map(init_sentry);
    if sentry_guard.is_some() {
        log::info!("Sentry error reporting enabled");
    }

    let store = open_store(&config);

    let mut context = ServerContext::from_config(store.clone() as Arc<dyn RecordStore>, &config);
    if opt_matches.opt_present("disable-udp") {
        context.enable_udp = false;
    }
    if opt_matches.opt_present("disable-tcp") {
        context.enable_tcp = false;
    }
    if !context.enable_udp && !context.enable_tcp {
        fail("Both UDP and TCP are disabled, nothing to serve");
    }

    let mut responder = DnsResponder::new(Arc::new(context));
    if let Err(e) = responder.start() {
        log::error!("Failed to start DNS responder: {}", e);
        sentry::capture_message(
            &format!("Failed to start DNS responder: {}", e),
            sentry::Level::Fatal,
        );
        process::exit(1);
    }

    tracing::info!(
        udp = ?responder.udp_addr(),
        tcp = ?responder.tcp_addr(),
        udp_threads = config.udp_threads,
        tcp_threads = config.tcp_threads,
        data_file = ?config.data_file,
        "pdsdns responder started"
    );

    let mut scheduler = match config.poll_interval() {
        Some(interval) => {
            let engine = match VerificationEngine::from_config(store.clone(), &config) {
                Ok(engine) => Arc::new(engine),
                Err(e) => fail(&format!("Failed to set up verification engine: {}", e)),
            };

            let mut scheduler = VerificationScheduler::new(engine, interval);
            if let Err(e) = scheduler.start() {
                fail(&format!("Failed to start verification scheduler: {}", e));
            }
            log::info!("Polling pending verifications every {:?}", interval);
            Some(scheduler)
        }
        None => None,
    };

    responder.wait();

    if let Some(ref mut scheduler) = scheduler {
        scheduler.stop();
    }
}
