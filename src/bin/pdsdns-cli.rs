//! pdsdns CLI
//!
//! Operator interface for domain verification: issue and check challenges,
//! manage the records the responder serves and inspect live DNS.

use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use comfy_table::Table;
use serde::Serialize;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use pdsdns::config::Config;
use pdsdns::dns::client::{DnsClient, DnsNetworkClient};
use pdsdns::dns::protocol::{DnsRecord, QueryType};
use pdsdns::dns::resolver::{TxtResolver, UpstreamTxtResolver};
use pdsdns::logging::{init_logging, LogFormat};
use pdsdns::store::{
    Domain, MemoryStore, Record, RecordStore, RecordType, ServiceType, Verification,
    VerificationStatus,
};
use pdsdns::verification::challenge::{extract_verification_token, normalize_domain, ExternalProvider};
use pdsdns::verification::{VerificationEngine, VerificationRef};

type CliResult = Result<(), Box<dyn std::error::Error>>;

/// pdsdns CLI - domain ownership verification through DNS TXT records
#[derive(Parser)]
#[command(name = "pdsdns-cli")]
#[command(version)]
#[command(about = "Manage DNS TXT verifications and the records pdsdns serves", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "PDSDNS_CONFIG")]
    config: Option<PathBuf>,

    /// JSON data file shared with the pdsdns server
    #[arg(short, long, env = "PDSDNS_DATA_FILE")]
    data_file: Option<PathBuf>,

    /// Output format
    #[arg(short = 'o', long, value_enum, default_value = "table")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// No color output
    #[arg(long)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(ValueEnum, Clone, Copy, PartialEq)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Issue a TXT challenge for a domain
    Challenge {
        domain: String,
        /// Service requesting the verification (pds, onelogin, government, other)
        #[arg(short, long, default_value = "pds")]
        service: String,
        #[arg(long)]
        service_id: Option<String>,
    },

    /// Attempt a verification, by id or token
    Verify { reference: String },

    /// Mark a verification as verified
    Complete {
        id: String,
        #[arg(long)]
        service_id: Option<String>,
        /// Skip the DNS evidence check
        #[arg(long)]
        force: bool,
    },

    /// Check a token published for an external provider
    VerifyExternal {
        domain: String,
        token: String,
        #[arg(short, long, default_value = "onelogin")]
        provider: String,
    },

    /// Drop every verification of a domain and clear its verified flag
    Reset { domain: String },

    /// List verifications of a domain, or every pending one
    List { domain: Option<String> },

    /// Manage served records
    Record {
        #[command(subcommand)]
        action: RecordCommands,
    },

    /// Look up TXT records through the configured upstream
    Lookup {
        name: String,
        /// Nameserver to ask instead of the configured upstream, as host:port
        #[arg(short, long)]
        server: Option<String>,
    },

    /// Send a query to a running responder
    Query {
        name: String,
        #[arg(short = 't', long, default_value = "TXT")]
        record_type: String,
        #[arg(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Show the TXT value for a token, or extract the token from a value
    Token {
        #[command(subcommand)]
        action: TokenCommands,
    },
}

#[derive(Subcommand)]
enum RecordCommands {
    /// Add a record to a domain
    Add {
        domain: String,
        /// Subdomain label, @ for the apex
        name: String,
        #[arg(value_name = "TYPE")]
        record_type: String,
        value: String,
        #[arg(long)]
        ttl: Option<u32>,
    },
    /// List the records of a domain
    List { domain: String },
    /// Stop serving a record
    Deactivate { id: String },
    /// Serve a deactivated record again
    Activate { id: String },
}

#[derive(Subcommand)]
enum TokenCommands {
    Format { token: String },
    Extract { value: String },
}

struct OutputFormatter {
    format: OutputFormat,
}

impl OutputFormatter {
    fn new(format: OutputFormat, no_color: bool) -> Self {
        if no_color {
            colored::control::set_override(false);
        }
        Self { format }
    }

    fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    fn print_json<T: Serialize>(&self, data: &T) -> CliResult {
        println!("{}", serde_json::to_string_pretty(data)?);
        Ok(())
    }

    fn print_pairs(&self, pairs: Vec<(&str, String)>) {
        let mut table = Table::new();
        table.set_header(vec!["Key", "Value"]);
        for (key, value) in pairs {
            table.add_row(vec![key.to_string(), value]);
        }
        println!("{}", table);
    }

    fn print_verifications(&self, verifications: &[Verification]) {
        let mut table = Table::new();
        table.set_header(vec!["ID", "Domain", "Service", "Status", "Attempts", "Expires"]);
        for v in verifications {
            table.add_row(vec![
                v.id.to_string(),
                v.domain.clone(),
                v.service_type.to_string(),
                v.status.to_string(),
                v.attempts.to_string(),
                v.expires_at.to_rfc3339(),
            ]);
        }
        println!("{}", table);
    }

    fn print_records(&self, records: &[Record]) {
        let mut table = Table::new();
        table.set_header(vec!["ID", "Name", "Type", "Value", "TTL", "Active"]);
        for r in records {
            table.add_row(vec![
                r.id.to_string(),
                r.fqdn(),
                r.record_type.to_string(),
                r.value.clone(),
                r.ttl.to_string(),
                r.active.to_string(),
            ]);
        }
        println!("{}", table);
    }

    fn print_success(&self, message: &str) {
        println!("{} {}", "✓".green().bold(), message);
    }

    fn print_error(&self, message: &str) {
        eprintln!("{} {}", "✗".red().bold(), message);
    }

    fn print_warning(&self, message: &str) {
        println!("{} {}", "⚠".yellow().bold(), message);
    }

    fn print_info(&self, message: &str) {
        println!("{} {}", "ℹ".blue().bold(), message);
    }
}

/// `host[:port]` with the port defaulting to 53, same rules as `upstream_dns`
fn parse_server(config: &Config, server: &str) -> Result<(String, u16), Box<dyn std::error::Error>> {
    let mut probe = config.clone();
    probe.upstream_dns = server.to_string();
    Ok(probe.upstream()?)
}

fn main() {
    let cli = Cli::parse();
    let formatter = OutputFormatter::new(cli.output, cli.no_color);

    if let Err(e) = run(cli, &formatter) {
        formatter.print_error(&e.to_string());
        process::exit(1);
    }
}

fn run(cli: Cli, formatter: &OutputFormatter) -> CliResult {
    let mut config = Config::load(cli.config.as_deref())?;
    if cli.data_file.is_some() {
        config.data_file = cli.data_file.clone();
    }

    let level = if cli.verbose { "debug" } else { "warn" };
    init_logging(level, LogFormat::Text);

    match cli.command {
        Commands::Lookup { name, server } => handle_lookup(&config, &name, server, formatter),
        Commands::Query {
            name,
            record_type,
            host,
            port,
        } => handle_query(&config, &name, &record_type, &host, port, formatter),
        Commands::Token { action } => handle_token(action, formatter),
        Commands::Record { action } => {
            handle_record_commands(action, &open_store(&config, formatter)?, formatter)
        }
        command => {
            let store = open_store(&config, formatter)?;
            let engine = VerificationEngine::from_config(store, &config)?;
            handle_verification_commands(command, &engine, formatter)
        }
    }
}

fn open_store(
    config: &Config,
    formatter: &OutputFormatter,
) -> Result<Arc<MemoryStore>, Box<dyn std::error::Error>> {
    match config.data_file {
        Some(ref path) => Ok(Arc::new(MemoryStore::open(path)?)),
        None => {
            formatter.print_warning("No data file configured, changes will not persist");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

fn handle_verification_commands(
    command: Commands,
    engine: &VerificationEngine,
    formatter: &OutputFormatter,
) -> CliResult {
    match command {
        Commands::Challenge {
            domain,
            service,
            service_id,
        } => {
            let service_type: ServiceType = service.parse()?;
            let challenge =
                engine.generate_challenge(&domain, service_type, service_id.as_deref())?;

            if formatter.is_json() {
                return formatter.print_json(&challenge);
            }
            formatter.print_pairs(vec![
                ("Verification", challenge.verification_id.to_string()),
                ("Domain", challenge.domain.clone()),
                ("Record name", challenge.txt_record_name.clone()),
                ("Record value", challenge.txt_record_value.clone()),
                ("Expires", challenge.expires_at.to_rfc3339()),
            ]);
            formatter.print_info(&challenge.instructions);
        }
        Commands::Verify { reference } => {
            let outcome = engine.check_status(&VerificationRef::parse(&reference))?;

            if formatter.is_json() {
                return formatter.print_json(&outcome);
            }
            match outcome.status {
                VerificationStatus::Verified => {
                    formatter.print_success(&format!("{} is verified", outcome.domain))
                }
                VerificationStatus::Pending => formatter.print_warning(&format!(
                    "{} is not verified yet, {} attempts remaining",
                    outcome.domain, outcome.attempts_remaining
                )),
                status => formatter.print_error(&format!("{} is {}", outcome.domain, status)),
            }
        }
        Commands::Complete {
            id,
            service_id,
            force,
        } => {
            let id = uuid::Uuid::parse_str(&id)?;
            let completion = engine.complete_verification(id, service_id.as_deref(), force)?;

            if formatter.is_json() {
                return formatter.print_json(&completion);
            }
            if completion.success {
                formatter.print_success(&format!("Verification {}", completion.status));
            } else {
                formatter.print_error(&format!(
                    "No evidence found, verification is {}",
                    completion.status
                ));
            }
        }
        Commands::VerifyExternal {
            domain,
            token,
            provider,
        } => {
            let provider: ExternalProvider = provider.parse()?;
            let outcome = engine.verify_external(&domain, &token, provider)?;

            if formatter.is_json() {
                return formatter.print_json(&outcome);
            }
            formatter.print_info(&format!("{} is {}", outcome.domain, outcome.status));
        }
        Commands::Reset { domain } => {
            let outcome = engine.reset_verification(&domain)?;

            if formatter.is_json() {
                return formatter.print_json(&outcome);
            }
            formatter.print_success(&format!(
                "Removed {} verifications of {}",
                outcome.removed, outcome.domain
            ));
        }
        Commands::List { domain } => {
            let verifications = match domain {
                Some(ref domain) => engine.verifications_for_domain(domain)?,
                None => engine.pending_verifications()?,
            };

            if formatter.is_json() {
                return formatter.print_json(&verifications);
            }
            if verifications.is_empty() {
                formatter.print_info("No verifications found");
            } else {
                formatter.print_verifications(&verifications);
            }
        }
        _ => return Err("command does not use the verification engine".into()),
    }

    Ok(())
}

fn handle_record_commands(
    action: RecordCommands,
    store: &Arc<MemoryStore>,
    formatter: &OutputFormatter,
) -> CliResult {
    match action {
        RecordCommands::Add {
            domain,
            name,
            record_type,
            value,
            ttl,
        } => {
            let domain_name =
                normalize_domain(&domain).ok_or_else(|| format!("invalid domain: {}", domain))?;
            let record_type: RecordType = record_type.parse()?;

            let domain = store.insert_domain(Domain::new(&domain_name))?;
            let record = store.insert_record(Record::new(&domain, &name, record_type, &value, ttl))?;

            if formatter.is_json() {
                return formatter.print_json(&record);
            }
            formatter.print_success(&format!("Added {} record {}", record.record_type, record.fqdn()));
        }
        RecordCommands::List { domain } => {
            let name = normalize_domain(&domain).unwrap_or(domain);
            let domain = store
                .find_domain_by_name(&name)?
                .ok_or_else(|| format!("domain {} not found", name))?;
            let records = store.find_records_for_domain(domain.id)?;

            if formatter.is_json() {
                return formatter.print_json(&records);
            }
            if records.is_empty() {
                formatter.print_info(&format!("{} has no records", domain.name));
            } else {
                formatter.print_records(&records);
            }
        }
        RecordCommands::Deactivate { id } => {
            let record = store.set_record_active(uuid::Uuid::parse_str(&id)?, false)?;
            if formatter.is_json() {
                return formatter.print_json(&record);
            }
            formatter.print_success(&format!("{} is no longer served", record.fqdn()));
        }
        RecordCommands::Activate { id } => {
            let record = store.set_record_active(uuid::Uuid::parse_str(&id)?, true)?;
            if formatter.is_json() {
                return formatter.print_json(&record);
            }
            formatter.print_success(&format!("{} is served again", record.fqdn()));
        }
    }

    Ok(())
}

fn handle_lookup(
    config: &Config,
    name: &str,
    server: Option<String>,
    formatter: &OutputFormatter,
) -> CliResult {
    let (host, port) = match server {
        Some(ref server) => parse_server(config, server)?,
        None => config.upstream()?,
    };

    let resolver = UpstreamTxtResolver::connect(&host, port, config.dns_lookup_timeout_ms)?;
    let values = resolver.lookup_txt(name)?;

    if formatter.is_json() {
        return formatter.print_json(&values);
    }
    if values.is_empty() {
        formatter.print_warning(&format!("No TXT records at {}", name));
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec!["TXT value", "Token"]);
    for value in &values {
        let token = extract_verification_token(value).unwrap_or_else(|| "-".to_string());
        table.add_row(vec![value.clone(), token]);
    }
    println!("{}", table);

    Ok(())
}

fn handle_query(
    config: &Config,
    name: &str,
    record_type: &str,
    host: &str,
    port: Option<u16>,
    formatter: &OutputFormatter,
) -> CliResult {
    let qtype = QueryType::from_name(record_type)
        .ok_or_else(|| format!("unsupported record type: {}", record_type))?;
    let port = port.unwrap_or(config.dns_port);

    let client = DnsNetworkClient::new(0, config.dns_lookup_timeout_ms)?;
    client.run()?;
    let packet = client.send_query(name, qtype, (host, port), false)?;

    if formatter.is_json() {
        return formatter.print_json(&packet.answers);
    }

    formatter.print_info(&format!(
        "{:?} from {}:{}, {} answers",
        packet.header.rescode,
        host,
        port,
        packet.answers.len()
    ));

    let mut table = Table::new();
    table.set_header(vec!["Name", "Type", "TTL", "Data"]);
    for answer in &packet.answers {
        let data = match *answer {
            DnsRecord::Txt { ref data, .. } => data.clone(),
            DnsRecord::A { addr, .. } => addr.to_string(),
            DnsRecord::Aaaa { addr, .. } => addr.to_string(),
            DnsRecord::Cname { ref host, .. } => host.clone(),
            _ => "-".to_string(),
        };
        table.add_row(vec![
            answer.get_domain().unwrap_or("-").to_string(),
            format!("{:?}", answer.get_querytype()),
            answer.get_ttl().to_string(),
            data,
        ]);
    }
    println!("{}", table);

    Ok(())
}

fn handle_token(action: TokenCommands, formatter: &OutputFormatter) -> CliResult {
    match action {
        TokenCommands::Format { token } => {
            let value = pdsdns::verification::challenge::format_txt_record(&token);
            if formatter.is_json() {
                return formatter.print_json(&value);
            }
            println!("{}", value);
        }
        TokenCommands::Extract { value } => match extract_verification_token(&value) {
            Some(token) => {
                if formatter.is_json() {
                    return formatter.print_json(&token);
                }
                println!("{}", token);
            }
            None => return Err(format!("no verification token in {:?}", value).into()),
        },
    }

    Ok(())
}
