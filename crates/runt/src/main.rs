use anyhow::{bail, Context, Result};
use cell_outputs::message::KernelMessage;
use cell_outputs::output::{CellOutput, ProtocolOutput};
use cell_outputs::settings::{default_settings_path, load_settings};
use cell_outputs::stream_format::format_stream_text;
use cell_outputs::{
    mime, to_protocol_record, to_renderable, CellExecution, MemoryNotebook, NotebookHost,
    RecordedKernel,
};
use clap::{Parser, Subcommand};
use log::debug;
use serde::Serialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tabled::{settings::Style, Table, Tabled};

#[derive(Tabled)]
struct OutputTableRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "TYPE")]
    output_type: String,
    #[tabled(rename = "MIMES")]
    mimes: String,
    #[tabled(rename = "PREVIEW")]
    preview: String,
}

impl OutputTableRow {
    fn new(index: usize, output: &CellOutput) -> Self {
        OutputTableRow {
            index,
            output_type: output
                .output_type()
                .map(|t| t.to_string())
                .unwrap_or_else(|| "-".to_string()),
            mimes: output.mimes().join(", "),
            preview: preview(output),
        }
    }
}

#[derive(Tabled)]
struct RoundtripTableRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "TYPE")]
    output_type: String,
    #[tabled(rename = "ITEMS")]
    items: usize,
    #[tabled(rename = "EXACT")]
    exact: String,
}

#[derive(Serialize)]
struct ReplayReport {
    status: String,
    execution_count: Option<i64>,
    source: String,
    outputs: Vec<ProtocolOutput>,
}

/// Text shown for an output in the summary table.
fn preview(output: &CellOutput) -> String {
    let Some(item) = output.items.first() else {
        return "-".to_string();
    };
    if mime::is_binary_image(&item.mime) {
        return format!("<{} bytes>", item.data.len());
    }
    truncate(&item.as_text(), 60)
}

/// Truncate text for display, replacing newlines with spaces.
fn truncate(text: &str, max_chars: usize) -> String {
    let single_line = text.replace('\n', " ");
    if single_line.chars().count() <= max_chars {
        single_line
    } else {
        let kept: String = single_line.chars().take(max_chars - 3).collect();
        format!("{}...", kept)
    }
}

/// Shorten a path for display by replacing home directory with ~
fn shorten_path(path: &Path) -> String {
    if let Some(home) = dirs::home_dir() {
        if let Ok(relative) = path.strip_prefix(&home) {
            return format!("~/{}", relative.display());
        }
    }
    path.display().to_string()
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Execution settings file (default: platform config dir)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute one cell against a recorded kernel session (JSON lines)
    Replay {
        /// Path to the recorded session
        session: PathBuf,
        /// Cell source (default: the code of the session's execute_input)
        #[arg(long)]
        code: Option<String>,
        /// Print the resulting outputs as nbformat JSON
        #[arg(long)]
        json: bool,
    },
    /// Convert nbformat outputs to rendered outputs and back, reporting differences
    Roundtrip {
        /// JSON file holding an array of nbformat outputs
        outputs: PathBuf,
    },
    /// Apply carriage-return and backspace handling to stream text
    FormatStream {
        /// Text to format (default: read stdin)
        text: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    match cli.command {
        Some(Commands::Replay {
            session,
            code,
            json,
        }) => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(replay(&session, code, json, cli.settings.as_deref()))
        }
        Some(Commands::Roundtrip { outputs }) => roundtrip(&outputs),
        Some(Commands::FormatStream { text }) => format_stream(text),
        None => {
            println!("No command specified. Use --help for usage information.");
            Ok(())
        }
    }
}

async fn replay(
    session: &Path,
    code: Option<String>,
    json: bool,
    settings_path: Option<&Path>,
) -> Result<()> {
    let settings_path = settings_path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_settings_path);
    let settings = load_settings(&settings_path)
        .with_context(|| format!("loading {}", shorten_path(&settings_path)))?;
    debug!("Execution settings: {:?}", settings);

    let kernel = RecordedKernel::from_path(session)
        .with_context(|| format!("reading session {}", shorten_path(session)))?;
    let code = code.unwrap_or_else(|| {
        kernel
            .messages()
            .iter()
            .find_map(|message| match message {
                KernelMessage::ExecuteInput(input) => Some(input.code.clone()),
                _ => None,
            })
            .unwrap_or_default()
    });

    let notebook = Arc::new(MemoryNotebook::new());
    let cell = notebook.add_cell(code);
    let mut execution = CellExecution::with_settings(notebook.clone(), settings);
    let result = execution.execute(&kernel, cell.clone()).await;

    // Whatever rendered before a failure is still reported.
    let snapshot = notebook
        .cell(&cell.id)
        .context("executed cell disappeared from the notebook")?;
    if json {
        let report = ReplayReport {
            status: format!("{:?}", execution.status()).to_lowercase(),
            execution_count: snapshot.execution_count,
            source: snapshot.source.clone(),
            outputs: notebook.nbformat_outputs(&cell.id),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let count = snapshot
            .execution_count
            .map(|c| c.to_string())
            .unwrap_or_else(|| " ".to_string());
        println!("[{}] {:?}", count, execution.status());
        if snapshot.outputs.is_empty() {
            println!("No outputs.");
        } else {
            let rows: Vec<OutputTableRow> = snapshot
                .outputs
                .iter()
                .enumerate()
                .map(|(i, output)| OutputTableRow::new(i, output))
                .collect();
            let table = Table::new(rows).with(Style::rounded()).to_string();
            println!("{}", table);
        }
        if let Some(display_id) = notebook.display_ids().display_id_for_cell(&cell.id) {
            println!("Display id: {}", display_id);
        }
        for extra in notebook.cells().iter().filter(|c| c.id != cell.id) {
            println!("Inserted cell: {}", truncate(&extra.source, 60));
        }
    }

    result?;
    Ok(())
}

fn roundtrip(path: &Path) -> Result<()> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", shorten_path(path)))?;
    let records: Vec<ProtocolOutput> =
        serde_json::from_str(&contents).context("expected a JSON array of nbformat outputs")?;

    let mut reconstructed = Vec::with_capacity(records.len());
    let mut rows = Vec::with_capacity(records.len());
    let mut differing = 0;
    for (index, record) in records.iter().enumerate() {
        let rendered = to_renderable(record);
        let back = to_protocol_record(&rendered);
        let exact = &back == record;
        if !exact {
            differing += 1;
        }
        rows.push(RoundtripTableRow {
            index,
            output_type: record.output_type().to_string(),
            items: rendered.items.len(),
            exact: if exact { "yes" } else { "no" }.to_string(),
        });
        reconstructed.push(back);
    }

    println!("{}", serde_json::to_string_pretty(&reconstructed)?);
    let table = Table::new(rows).with(Style::rounded()).to_string();
    eprintln!("{}", table);
    if differing > 0 {
        bail!("{} of {} outputs changed in the round trip", differing, records.len());
    }
    Ok(())
}

fn format_stream(text: Option<String>) -> Result<()> {
    let text = match text {
        Some(text) => text,
        None => {
            let mut buffer = String::new();
            std::io::stdin()
                .read_to_string(&mut buffer)
                .context("reading stdin")?;
            buffer
        }
    };
    print!("{}", format_stream_text(&text));
    Ok(())
}
