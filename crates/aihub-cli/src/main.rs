use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use aihub_contracts::catalogue::workflow_options;
use aihub_contracts::project::{Project, ProjectManifest, Timeline};
use aihub_contracts::store::{base_dir, FieldPath, HubConfig, CONFIG_FILE_NAME};
use aihub_engine::preview::fetch_workflow_preview;
use aihub_engine::{status, Connection, Controller, ControllerOptions, FileImageHost, ImageHost, SessionState};
use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

const PUMP_INTERVAL: Duration = Duration::from_millis(200);
const FINISHED_WITH_ERROR: &str = "Status: Workflow finished with error";

#[derive(Debug, Parser)]
#[command(name = "aihub-rs", version, about = "Headless AI Hub client")]
struct Cli {
    /// Base folder holding config.json and saved.json; defaults to $AIHUB_HOME or ~/aihub.
    #[arg(long, global = true)]
    base: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the server settings in use.
    Config,
    /// List the workflows the server offers.
    Workflows(WorkflowsArgs),
    /// Run one workflow and wait for it to finish.
    Run(RunArgs),
    /// Download a workflow's preview image.
    Preview(PreviewArgs),
    /// Inspect or edit a project's timelines without a server.
    #[command(subcommand)]
    Project(ProjectCommand),
}

#[derive(Debug, Parser)]
struct WorkflowsArgs {
    /// Project to filter the workflow list against.
    #[arg(long)]
    project: Option<PathBuf>,
    #[arg(long)]
    json: bool,
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,
}

#[derive(Debug, Parser)]
struct RunArgs {
    workflow: String,
    /// Field value as `id=value`; the value is parsed as JSON and falls back to a plain string.
    #[arg(long = "set", value_name = "ID=VALUE")]
    values: Vec<String>,
    /// Open this project before running.
    #[arg(long)]
    project: Option<PathBuf>,
    /// Where a project-init workflow creates its project when none is open.
    #[arg(long)]
    new_project: Option<PathBuf>,
    /// Image to open as the current image for fields that read the canvas.
    #[arg(long)]
    input: Option<PathBuf>,
    /// Save the current image, with any layers the server added, after the run.
    #[arg(long)]
    save_merged: Option<PathBuf>,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, default_value_t = 600)]
    timeout_secs: u64,
}

#[derive(Debug, Parser)]
struct PreviewArgs {
    workflow: String,
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Subcommand)]
enum ProjectCommand {
    /// Print the timeline tree.
    Show { manifest: PathBuf },
    /// Branch the current timeline and switch to the branch.
    Branch {
        manifest: PathBuf,
        #[arg(long)]
        name: String,
        /// Start a new root timeline instead of a child of the current one.
        #[arg(long)]
        root: bool,
    },
    Switch { manifest: PathBuf, timeline: String },
    Delete {
        manifest: PathBuf,
        timeline: String,
        /// Re-parent the children instead of deleting the whole subtree.
        #[arg(long)]
        keep_children: bool,
    },
}

fn main() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("aihub-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let base = cli.base.clone().unwrap_or_else(base_dir);
    match cli.command {
        Command::Config => run_config(&base),
        Command::Workflows(args) => run_workflows(&base, args),
        Command::Run(args) => run_workflow(&base, args),
        Command::Preview(args) => run_preview(&base, args),
        Command::Project(command) => run_project(command),
    }
}

fn load_config(base: &Path) -> Result<HubConfig> {
    HubConfig::ensure_and_load(base)
        .with_context(|| format!("failed to load {}", base.join(CONFIG_FILE_NAME).display()))
}

fn run_config(base: &Path) -> Result<i32> {
    let config = load_config(base)?;
    println!("base: {}", base.display());
    println!("server: {}", config.server_label());
    println!("websocket: {}", config.websocket_url());
    println!("previews: {}", config.preview_url("{id}"));
    Ok(0)
}

/// Prints each status line once, as the controller changes it.
#[derive(Debug, Default)]
struct StatusEcho {
    last: String,
}

impl StatusEcho {
    fn echo<H: ImageHost>(&mut self, controller: &Controller<H>) {
        if controller.status() != self.last {
            self.last = controller.status().to_string();
            eprintln!("{}", self.last);
        }
    }
}

fn connect(base: &Path, events: Option<PathBuf>, host: FileImageHost) -> Result<Controller<FileImageHost>> {
    let config = load_config(base)?;
    let connection = match Connection::websocket(&config) {
        Ok(connection) => connection,
        Err(err) => {
            eprintln!("{}", status::could_not_connect(&config));
            return Err(err);
        }
    };
    let mut options = ControllerOptions::new(base, config);
    if let Some(events) = events {
        options.events_path = events;
    }
    Controller::new(options, connection, host)
}

/// Pumps until `done` holds, the session errors or `timeout` passes.
fn pump_until<H: ImageHost>(
    controller: &mut Controller<H>,
    echo: &mut StatusEcho,
    timeout: Duration,
    done: impl Fn(&Controller<H>) -> bool,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        echo.echo(controller);
        if done(controller) {
            return Ok(());
        }
        if controller.state() == SessionState::Errored {
            bail!("{}", controller.status());
        }
        if Instant::now() >= deadline {
            bail!("timed out after {}s: {}", timeout.as_secs(), controller.status());
        }
        controller.wait_and_pump(PUMP_INTERVAL)?;
    }
}

fn wait_for_catalogue<H: ImageHost>(
    controller: &mut Controller<H>,
    echo: &mut StatusEcho,
    timeout: Duration,
) -> Result<()> {
    pump_until(controller, echo, timeout, |controller| {
        controller.state() == SessionState::Ready
    })
}

fn run_workflows(base: &Path, args: WorkflowsArgs) -> Result<i32> {
    let mut controller = connect(base, None, FileImageHost::new())?;
    let mut echo = StatusEcho::default();
    wait_for_catalogue(&mut controller, &mut echo, Duration::from_secs(args.timeout_secs))?;
    if let Some(manifest) = &args.project {
        controller.open_project(manifest)?;
    }

    // listed straight from the catalogue so the remembered selection stays put
    let catalogue = controller
        .catalogue()
        .ok_or_else(|| anyhow!("no workflow catalogue received"))?;
    let mut listing = Vec::new();
    for context in &catalogue.contexts {
        for category in catalogue.categories_for(context) {
            let workflows: Vec<Value> = workflow_options(catalogue, context, category, controller.session().view())
                .into_iter()
                .map(|option| {
                    json!({
                        "id": option.id,
                        "label": option.display_label(),
                        "project_init": option.project_init,
                        "special": option.special,
                    })
                })
                .collect();
            listing.push(json!({ "context": context, "category": category, "workflows": workflows }));
        }
    }
    let rejected: Vec<Value> = catalogue
        .rejected
        .iter()
        .map(|rejected| json!({ "workflow_id": rejected.workflow_id, "reason": rejected.reason }))
        .collect();
    controller.shutdown();

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({ "categories": listing, "rejected": rejected }))?
        );
        return Ok(0);
    }
    for entry in &listing {
        println!(
            "{} / {}",
            entry["context"].as_str().unwrap_or_default(),
            entry["category"].as_str().unwrap_or_default()
        );
        for workflow in entry["workflows"].as_array().into_iter().flatten() {
            println!(
                "  {:<32} {}",
                workflow["id"].as_str().unwrap_or_default(),
                workflow["label"].as_str().unwrap_or_default()
            );
        }
    }
    for rejected in &rejected {
        println!(
            "rejected {}: {}",
            rejected["workflow_id"].as_str().unwrap_or_default(),
            rejected["reason"].as_str().unwrap_or_default()
        );
    }
    Ok(0)
}

/// Splits `id=value`, reading the value as JSON when it parses.
fn parse_assignment(raw: &str) -> Result<(FieldPath, Value)> {
    let (id, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("expected ID=VALUE, got {raw:?}"))?;
    let id = id.trim();
    if id.is_empty() {
        bail!("missing field id in {raw:?}");
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((FieldPath::single(id), value))
}

fn run_workflow(base: &Path, args: RunArgs) -> Result<i32> {
    let assignments = args
        .values
        .iter()
        .map(|raw| parse_assignment(raw))
        .collect::<Result<Vec<_>>>()?;
    let mut host = FileImageHost::new();
    if let Some(input) = &args.input {
        host.load(input)
            .with_context(|| format!("failed to open {}", input.display()))?;
    }

    let mut controller = connect(base, args.events.clone(), host)?;
    let mut echo = StatusEcho::default();
    let timeout = Duration::from_secs(args.timeout_secs);
    wait_for_catalogue(&mut controller, &mut echo, timeout)?;
    if let Some(manifest) = &args.project {
        controller.open_project(manifest)?;
    }

    let (context, category) = controller
        .catalogue()
        .and_then(|catalogue| catalogue.workflow(&args.workflow))
        .map(|workflow| (workflow.context.clone(), workflow.category.clone()))
        .ok_or_else(|| anyhow!("the server does not offer workflow {}", args.workflow))?;
    controller.select_context(&context)?;
    controller.select_category(&category)?;
    controller.select_workflow(&args.workflow)?;
    let now = Instant::now();
    for (field, value) in assignments {
        controller.set_value(&field, value, now)?;
    }

    controller.run_workflow(args.new_project.as_deref())?;
    tracing::info!(workflow_id = %args.workflow, "waiting for the run to finish");
    pump_until(&mut controller, &mut echo, timeout, |controller| !controller.is_running())?;

    if let Some(target) = &args.save_merged {
        controller.host().save_merged(target)?;
        println!("saved {}", target.display());
    }
    if let Some(project) = controller.session().project() {
        println!("project: {}", project.manifest_path().display());
    }
    println!("files: {}", controller.session().routing_dir().display());
    let failed = controller.status().starts_with(FINISHED_WITH_ERROR);
    controller.shutdown();
    Ok(if failed { 2 } else { 0 })
}

fn run_preview(base: &Path, args: PreviewArgs) -> Result<i32> {
    let config = load_config(base)?;
    let Some(bytes) = fetch_workflow_preview(&config, &args.workflow) else {
        eprintln!("no preview for {}", args.workflow);
        return Ok(1);
    };
    std::fs::write(&args.out, &bytes)
        .with_context(|| format!("failed to write {}", args.out.display()))?;
    println!("saved {} ({} bytes)", args.out.display(), bytes.len());
    Ok(0)
}

fn run_project(command: ProjectCommand) -> Result<i32> {
    match command {
        ProjectCommand::Show { manifest } => {
            let project = Project::open(&manifest)?;
            print!("{}", render_timelines(project.manifest()));
        }
        ProjectCommand::Branch {
            manifest,
            name,
            root,
        } => {
            let mut project = Project::open(&manifest)?;
            let id = project.branch_timeline(&name, root)?;
            println!("{id}");
        }
        ProjectCommand::Switch { manifest, timeline } => {
            let mut project = Project::open(&manifest)?;
            project.switch_timeline(&timeline)?;
        }
        ProjectCommand::Delete {
            manifest,
            timeline,
            keep_children,
        } => {
            let mut project = Project::open(&manifest)?;
            for removed in project.delete_timeline(&timeline, keep_children)? {
                println!("deleted {removed}");
            }
        }
    }
    Ok(0)
}

/// Indented timeline forest; `*` marks the current timeline.
fn render_timelines(manifest: &ProjectManifest) -> String {
    fn walk(manifest: &ProjectManifest, timeline: &Timeline, depth: usize, out: &mut String) {
        let marker = if manifest.current_timeline.as_deref() == Some(timeline.id.as_str()) {
            '*'
        } else {
            ' '
        };
        out.push_str(&format!(
            "{marker} {}{} ({})\n",
            "  ".repeat(depth),
            timeline.name,
            timeline.id
        ));
        for child in manifest.children_of(&timeline.id) {
            walk(manifest, child, depth + 1, out);
        }
    }

    let mut out = format!("{} [{}]\n", manifest.project_name, manifest.project_type);
    for root in manifest.roots() {
        walk(manifest, root, 0, &mut out);
    }
    for skipped in manifest.skipped() {
        out.push_str(&format!("  skipped {} ({})\n", skipped.name, skipped.id));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignments_read_json_or_text() -> Result<()> {
        let (field, value) = parse_assignment("steps=30")?;
        assert_eq!(field, FieldPath::single("steps"));
        assert_eq!(value, json!(30));

        let (_, value) = parse_assignment("prompt=a red fox")?;
        assert_eq!(value, json!("a red fox"));

        let (_, value) = parse_assignment(r#"model={"model":"m1","loras":[]}"#)?;
        assert_eq!(value["model"], "m1");

        assert!(parse_assignment("=3").is_err());
        assert!(parse_assignment("steps").is_err());
        Ok(())
    }

    #[test]
    fn timeline_tree_marks_current_and_nests_children() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let global = temp.path().join("saved.json");
        let mut project = Project::create_empty("comic", &temp.path().join("book"), "Start", &global)?;
        let start = project
            .current_timeline()
            .map(|timeline| timeline.id.clone())
            .ok_or_else(|| anyhow!("no initial timeline"))?;
        let branch = project.branch_timeline("Panel two", false)?;

        let rendered = render_timelines(project.manifest());
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], "book [comic]");
        assert_eq!(lines[1], format!("  Start ({start})"));
        assert_eq!(lines[2], format!("*   Panel two ({branch})"));
        Ok(())
    }
}
