//! Binary entry point for the `odq` query compiler CLI.
#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

use odata_query::{
    logging,
    metadata::MetadataDocument,
    protocol::{create_adapter, detect_version, CompiledRequest, ProtocolVersion, UpdateMethod},
    query::{
        command::{CommandState, Entry, ExpandOptions, Operation},
        CommandBuilder, Expr, Value,
    },
    session::{Settings, SettingsFile},
    types::{ErrorWithCode, Error, Result},
};

#[derive(Parser, Debug)]
#[command(
    name = "odq",
    version,
    about = "Compile OData queries offline",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format"
    )]
    format: OutputFormat,

    #[arg(long, short, global = true, help = "Log at debug level to stderr")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compile a JSON command description against a JSON entity model.
    Compile(CompileCmd),
    /// Detect the protocol version from headers and/or a metadata document.
    Detect(DetectCmd),
}

#[derive(Args, Debug)]
struct CompileCmd {
    #[arg(value_name = "COMMAND", help = "JSON command description")]
    command: PathBuf,

    #[arg(long, value_name = "FILE", help = "JSON entity model")]
    model: Option<PathBuf>,

    #[arg(long, value_name = "FILE", env = "ODQ_CONFIG", help = "TOML settings file")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "VERSION", help = "Protocol version, e.g. 3.0 or 4.0")]
    protocol: Option<String>,

    #[arg(long, help = "Reject filters targeting several entities")]
    strict: bool,

    #[arg(long, help = "Render enum literals without the type prefix")]
    enum_prefix_free: bool,

    #[arg(long, help = "Do not percent-escape literals")]
    no_escape: bool,

    #[arg(long, value_enum, help = "Method for updates that keep their key")]
    update_method: Option<UpdateMethodArg>,
}

#[derive(Args, Debug)]
struct DetectCmd {
    #[arg(
        long = "header",
        value_name = "NAME:VALUE",
        help = "Response header, repeatable"
    )]
    headers: Vec<String>,

    #[arg(long, value_name = "FILE", help = "Metadata document")]
    metadata: Option<PathBuf>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum UpdateMethodArg {
    Patch,
    Put,
}

impl From<UpdateMethodArg> for UpdateMethod {
    fn from(method: UpdateMethodArg) -> Self {
        match method {
            UpdateMethodArg::Patch => UpdateMethod::Patch,
            UpdateMethodArg::Put => UpdateMethod::Put,
        }
    }
}

/// JSON command description.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct CommandFile {
    collection: Option<String>,
    key: Vec<Value>,
    named_keys: BTreeMap<String, Value>,
    navigate: Vec<NavigateStep>,
    as_type: Option<String>,
    filter: Option<Expr>,
    filter_text: Option<String>,
    filter_on: BTreeMap<String, Expr>,
    search: Option<String>,
    skip: Option<u64>,
    top: Option<u64>,
    expand: Vec<ExpandItem>,
    select: Vec<String>,
    order_by: Vec<String>,
    count: bool,
    include_count: bool,
    link: Option<String>,
    media: Option<String>,
    query_options: Option<String>,
    function: Option<CallFile>,
    action: Option<CallFile>,
    operation: Option<Operation>,
    entry: Option<Entry>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NavigateStep {
    Name(String),
    Keyed { name: String, key: Vec<Value> },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExpandItem {
    Path(String),
    WithOptions {
        path: String,
        #[serde(flatten)]
        options: ExpandOptions,
    },
}

#[derive(Debug, Deserialize)]
struct CallFile {
    name: String,
    #[serde(default)]
    parameters: BTreeMap<String, Value>,
}

impl CommandFile {
    fn into_state(self) -> Result<CommandState> {
        let mut builder = CommandBuilder::new();
        if let Some(collection) = self.collection {
            builder = builder.collection(collection);
        }
        if !self.key.is_empty() {
            builder = builder.key(self.key);
        }
        if !self.named_keys.is_empty() {
            builder = builder.named_keys(self.named_keys);
        }
        for step in self.navigate {
            builder = match step {
                NavigateStep::Name(name) => builder.navigate(name),
                NavigateStep::Keyed { name, key } => builder.navigate(name).key(key),
            };
        }
        if let Some(type_name) = self.as_type {
            builder = builder.as_type(type_name);
        }
        if let Some(filter) = self.filter {
            builder = builder.filter(filter);
        }
        if let Some(text) = self.filter_text {
            builder = builder.filter_text(text);
        }
        for (entity, expr) in self.filter_on {
            builder = builder.filter_on(entity, expr);
        }
        if let Some(term) = self.search {
            builder = builder.search(term);
        }
        if let Some(skip) = self.skip {
            builder = builder.skip(skip);
        }
        if let Some(top) = self.top {
            builder = builder.top(top);
        }
        for item in self.expand {
            builder = match item {
                ExpandItem::Path(path) => builder.expand(path),
                ExpandItem::WithOptions { path, options } => builder.expand_with(path, options),
            };
        }
        if !self.select.is_empty() {
            builder = builder.select(self.select);
        }
        for order in self.order_by {
            builder = match order.trim().strip_suffix(" desc") {
                Some(name) => builder.order_by_descending(name.trim()),
                None => builder.order_by(order.trim().trim_end_matches(" asc")),
            };
        }
        if self.count {
            builder = builder.count();
        }
        if self.include_count {
            builder = builder.include_count();
        }
        if let Some(link) = self.link {
            builder = builder.link(link);
        }
        if let Some(media) = self.media {
            builder = builder.media(media);
        }
        if let Some(options) = self.query_options {
            builder = builder.query_options(options);
        }
        if let Some(call) = self.function {
            builder = builder.function(call.name, call.parameters);
        }
        if let Some(call) = self.action {
            builder = builder.action(call.name, call.parameters);
        }
        builder = match (self.operation.unwrap_or_default(), self.entry) {
            (Operation::Query, Some(entry)) => builder.set(entry),
            (Operation::Query, None) => builder,
            (Operation::Insert, entry) => builder.insert(entry.unwrap_or_default()),
            (Operation::Update, entry) => builder.update(entry.unwrap_or_default()),
            (Operation::Delete, _) => builder.delete(),
        };
        builder.build()
    }
}

#[derive(Debug, Serialize)]
struct CompileReport {
    version: ProtocolVersion,
    uri: String,
    request: CompiledRequest,
}

#[derive(Debug, Serialize)]
struct DetectReport {
    version: ProtocolVersion,
}

fn main() {
    let cli = Cli::parse();
    if cli.verbose {
        logging::init_logging(Some("odata_query=debug"));
    } else {
        logging::init_logging(Some("odata_query=warn"));
    }
    if let Err(err) = run(cli) {
        eprintln!("error: {}", ErrorWithCode(&err));
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Compile(cmd) => {
            let report = compile(cmd)?;
            emit(cli.format, &report, || print_compile_text(&report))
        }
        Command::Detect(cmd) => {
            let report = detect(cmd)?;
            emit(cli.format, &report, || println!("{}", report.version))
        }
    }
}

fn compile(cmd: CompileCmd) -> Result<CompileReport> {
    let mut settings = match &cmd.config {
        Some(path) => SettingsFile::load(path)?.into_settings()?,
        None => Settings::new("http://localhost/"),
    };
    settings.strict_filter_targets |= cmd.strict;
    settings.enum_prefix_free |= cmd.enum_prefix_free;
    if cmd.no_escape {
        settings.escape_literals = false;
    }
    if let Some(method) = cmd.update_method {
        settings.preferred_update_method = method.into();
    }
    if let Some(path) = &cmd.model {
        settings.metadata_document = Some(read(path)?);
    }
    let raw = settings
        .metadata_document
        .clone()
        .ok_or_else(|| Error::Config("an entity model is required (--model or config)".into()))?;

    let mut document = MetadataDocument::new(raw);
    document.version_tokens.extend(cmd.protocol.clone());
    let version = document.detect_version()?;
    let resolver = settings.model_loader.load(&document)?;
    let adapter = create_adapter(
        settings.adapter_factory.as_deref(),
        version,
        resolver,
        &settings.adapter_options(),
    )?;

    let command: CommandFile = serde_json::from_str(&read(&cmd.command)?)
        .map_err(|err| Error::Invalid(format!("command description: {err}")))?;
    let request = adapter.compile(&command.into_state()?)?;
    Ok(CompileReport {
        version,
        uri: request.relative_uri(),
        request,
    })
}

fn detect(cmd: DetectCmd) -> Result<DetectReport> {
    let mut headers = Vec::with_capacity(cmd.headers.len());
    for header in &cmd.headers {
        let (name, value) = header
            .split_once(':')
            .ok_or_else(|| Error::Invalid(format!("header '{header}' is not NAME:VALUE")))?;
        headers.push((name.trim(), value.trim()));
    }
    let document = match &cmd.metadata {
        Some(path) => Some(read(path)?),
        None => None,
    };
    let version = detect_version(headers, document.as_deref())?;
    Ok(DetectReport { version })
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|err| Error::Config(format!("reading {}: {err}", path.display())))
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<()>
where
    T: Serialize,
    F: Fn(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)
                .map_err(|err| Error::Invalid(err.to_string()))?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn print_compile_text(report: &CompileReport) {
    println!("{} {}", report.request.method, report.uri);
    if let Some(payload) = &report.request.payload {
        if let Ok(json) = serde_json::to_string(payload) {
            println!("{json}");
        }
    }
}
