//! `hl7-processor`: listen for MLLP traffic, publish message files, or convert between formats.
//!
//! Usage:
//!   hl7-processor listen --config hl7.toml
//!   hl7-processor send --host 10.0.0.5 adt_a01.hl7 oru_r01.hl7
//!   hl7-processor convert adt_a01.hl7 --to flat-json
//!   hl7-processor transform --mapping adt.json adt_a01.hl7

use clap::{Parser, Subcommand, ValueEnum};
use log::{error, info, warn};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

use hl7_processor::client::MllpClient;
use hl7_processor::convert::{self, json, xml, JsonOptions};
use hl7_processor::hl7::{parse_message, Hl7Message};
use hl7_processor::pipeline::MessageProcessor;
use hl7_processor::server::{MllpServer, ServerEvent};
use hl7_processor::settings::Settings;
use hl7_processor::store::{InMemoryQueue, InMemoryRepository};
use hl7_processor::transform::{FieldMappingConfiguration, TransformationEngine};

#[derive(Parser, Debug)]
#[command(name = "hl7-processor")]
#[command(about = "HL7 v2 MLLP listener, publisher and format converter")]
#[command(version)]
struct Args {
    /// Settings file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is not set; overrides the settings file
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept MLLP connections, acknowledge and process every message
    Listen {
        #[arg(long)]
        bind: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
        /// Field mapping configuration applied to every message
        #[arg(short, long)]
        mapping: Option<PathBuf>,
    },
    /// Send message files over MLLP, one message per file
    Send {
        #[arg(long)]
        host: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
        /// Don't wait for acknowledgments
        #[arg(long)]
        no_wait: bool,
        /// Keep sending after a failure
        #[arg(long)]
        continue_on_error: bool,
        /// Pause between messages
        #[arg(long)]
        delay_ms: Option<u64>,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Convert a message file between HL7, JSON, flat JSON and XML
    Convert {
        input: PathBuf,
        /// Input format, guessed from the extension and content when omitted
        #[arg(long, value_enum)]
        from: Option<Format>,
        #[arg(long, value_enum, default_value = "json")]
        to: Format,
        /// Leave out the metadata block of document JSON
        #[arg(long)]
        no_metadata: bool,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Apply a field mapping configuration to a message file and print the record as JSON
    Transform {
        #[arg(short, long)]
        mapping: PathBuf,
        input: PathBuf,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Format {
    Hl7,
    Json,
    FlatJson,
    Xml,
    ClinicalXml,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(level) = &args.log_level {
        settings.processing.log_level = level.clone();
    }
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&settings.processing.log_level))
        .init();

    match args.command {
        Command::Listen { bind, port, mapping } => {
            if let Some(bind) = bind {
                settings.server.bind_address = bind;
            }
            if let Some(port) = port {
                settings.server.port = port;
            }
            if mapping.is_some() {
                settings.processing.mapping_file = mapping;
            }
            listen(settings).await
        }
        Command::Send {
            host,
            port,
            no_wait,
            continue_on_error,
            delay_ms,
            files,
        } => {
            let mut config = settings.client;
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            config.wait_for_ack &= !no_wait;
            config.continue_on_error |= continue_on_error;
            if let Some(delay) = delay_ms {
                config.batch_delay_ms = delay;
            }
            send(MllpClient::new(config), &files).await
        }
        Command::Convert {
            input,
            from,
            to,
            no_metadata,
            output,
        } => {
            let text = std::fs::read_to_string(&input)?;
            let from = from.unwrap_or_else(|| guess_format(&input, &text));
            let message = read_message(&text, from)?;
            let options = JsonOptions {
                include_metadata: !no_metadata,
                ..JsonOptions::default()
            };
            let rendered = render(&message, to, &options)?;
            match output {
                Some(path) => std::fs::write(path, rendered)?,
                None => println!("{}", rendered),
            }
            Ok(())
        }
        Command::Transform { mapping, input } => {
            let engine = TransformationEngine::new(FieldMappingConfiguration::load(&mapping)?)?;
            let outcome = engine.transform_raw(&std::fs::read_to_string(&input)?)?;
            for warning in &outcome.warnings {
                warn!("{}", warning);
            }
            println!("{}", serde_json::to_string_pretty(&outcome.record)?);
            Ok(())
        }
    }
}

async fn listen(settings: Settings) -> Result<(), Box<dyn Error>> {
    let mut processor = MessageProcessor::new(Arc::new(InMemoryRepository::new()), Arc::new(InMemoryQueue::new()));
    if let Some(path) = &settings.processing.mapping_file {
        let config = FieldMappingConfiguration::load(path)?;
        info!(
            "Loaded mapping configuration '{}' v{} ({} mappings, {} rules)",
            config.name,
            config.version,
            config.field_mappings.len(),
            config.custom_rules.len()
        );
        processor = processor.with_engine(Arc::new(TransformationEngine::new(config)?));
    }

    let server = MllpServer::bind(settings.server).await?;
    let mut events = server.subscribe();
    let processing = server.subscribe();
    let shutdown = server.shutdown_token();
    let handle = server.spawn();

    let consumer = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { processor.consume(processing, shutdown).await }
    });
    let reporter = tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            };
            match event {
                ServerEvent::Connected { peer } => info!("Connection opened from {}", peer),
                ServerEvent::Disconnected { peer } => info!("Connection from {} closed", peer),
                ServerEvent::AckSent { peer, control_id, code } => {
                    info!("Sent {} for {} to {}", code, control_id, peer)
                }
                ServerEvent::Error { peer, error } => error!("Transport error ({:?}): {}", peer, error),
                ServerEvent::MessageReceived { .. } => {}
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    handle.stop().await?;
    shutdown.cancel();
    let _ = consumer.await;
    reporter.abort();
    Ok(())
}

async fn send(client: MllpClient, files: &[PathBuf]) -> Result<(), Box<dyn Error>> {
    let mut messages = Vec::with_capacity(files.len());
    for file in files {
        // MLLP peers expect carriage returns between segments
        let text = std::fs::read_to_string(file)?;
        messages.push(text.replace("\r\n", "\r").replace('\n', "\r"));
    }

    client.connect().await?;
    let results = client.send_batch(&messages).await;
    client.disconnect().await;

    for (file, result) in files.iter().zip(&results) {
        match (&result.ack, &result.error) {
            (_, Some(error)) => println!("{}: FAILED after {:?}: {}", file.display(), result.elapsed, error),
            (Some(ack), None) => println!(
                "{}: {} for {} in {:?}",
                file.display(),
                ack.code,
                ack.acknowledged_control_id,
                result.elapsed
            ),
            (None, None) => println!("{}: sent in {:?}", file.display(), result.elapsed),
        }
    }

    // a batch stopped early leaves the remaining files without a result
    let failed = results.iter().filter(|r| !r.success).count() + (files.len() - results.len());
    if failed > 0 {
        return Err(format!("{} of {} message(s) were not delivered", failed, files.len()).into());
    }
    Ok(())
}

fn guess_format(path: &Path, text: &str) -> Format {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match extension.as_deref() {
        Some("xml") => Format::Xml,
        Some("json") if text.contains("\"segments\"") => Format::Json,
        Some("json") => Format::FlatJson,
        _ => Format::Hl7,
    }
}

fn read_message(text: &str, format: Format) -> Result<Hl7Message, Box<dyn Error>> {
    let message = match format {
        Format::Hl7 => parse_message(text),
        Format::Json => json::from_json_str(text)?,
        Format::FlatJson => json::from_flat_json_str(text)?,
        Format::Xml => xml::from_xml(text)?,
        Format::ClinicalXml => return Err("clinical XML is an output-only format".into()),
    };
    for problem in &message.validation_errors {
        warn!("{}", problem);
    }
    Ok(message)
}

fn render(message: &Hl7Message, format: Format, options: &JsonOptions) -> Result<String, Box<dyn Error>> {
    Ok(match format {
        Format::Hl7 => message.to_hl7_string().replace('\r', "\n"),
        Format::Json => convert::to_json_string(message, options)?,
        Format::FlatJson => serde_json::to_string_pretty(&convert::to_flat_json(message))?,
        Format::Xml => convert::to_xml(message)?,
        Format::ClinicalXml => convert::to_clinical_xml(message)?,
    })
}
