//! Command handlers for the parabuild CLI.

use crate::config::Settings;
use crate::executor::{BuildReport, ExecutorOptions, Task, load_tasks, run_tasks};
use crate::manifest::{BuildPlan, Manifest, plan};
use crate::worker;
use anyhow::{Context, Result, bail};
use parabuild_ipc::{CommandSpawner, FrameCodec, LivenessPolicy};
use parabuild_toolchain::{BuildContext, Language, ProbeEnv, detect_compiler};
use std::path::Path;
use tracing::{info, warn};

/// Name of the hidden subcommand a worker process runs.
pub const WORKER_COMMAND: &str = "internal-worker";

/// Command line flags that take precedence over settings.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub jobs: Option<usize>,
    pub keep_going: bool,
    /// Seconds; zero disables the timeout.
    pub liveness_timeout: Option<u64>,
}

/// Load settings and apply command line overrides.
pub fn load_settings(overrides: &Overrides) -> Result<Settings> {
    let mut settings = Settings::load().context("Failed to load settings")?;
    apply_overrides(&mut settings, overrides);
    settings.validate().context("Invalid settings")?;
    Ok(settings)
}

fn apply_overrides(settings: &mut Settings, overrides: &Overrides) {
    if let Some(jobs) = overrides.jobs {
        settings.build.jobs = jobs;
    }
    if overrides.keep_going {
        settings.build.keep_going = true;
    }
    if let Some(secs) = overrides.liveness_timeout {
        settings.ipc.liveness_timeout_secs = (secs > 0).then_some(secs);
    }
}

/// Spawner re-running this executable as a worker.
pub fn worker_spawner(settings: &Settings, verbose: bool) -> Result<CommandSpawner> {
    let mut spawner = CommandSpawner::current_exe()
        .context("Failed to locate the parabuild executable")?
        .arg(WORKER_COMMAND)
        .arg("--max-frame-bytes")
        .arg(settings.ipc.max_frame_bytes.to_string());
    if verbose {
        spawner = spawner.arg("--verbose");
    }
    Ok(spawner)
}

/// `parabuild run`: execute a JSON task list.
pub fn run(path: &Path, settings: &Settings, verbose: bool, json: bool) -> Result<()> {
    let tasks = load_tasks(path).with_context(|| format!("Failed to load {}", path.display()))?;
    let options = ExecutorOptions::from_settings(settings);
    log_options(&options, tasks.len());

    let report = run_tasks(tasks, &options, worker_spawner(settings, verbose)?)
        .context("Failed to run tasks")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for outcome in &report.outcomes {
            if !outcome.stdout.is_empty() {
                print!("{}", outcome.stdout);
            }
        }
    }
    finish(&report)
}

/// `parabuild build`: compile every source, then link binaries wave by wave.
pub fn build(manifest_path: &Path, settings: &Settings, verbose: bool) -> Result<()> {
    let manifest = Manifest::load(manifest_path)
        .with_context(|| format!("Failed to load {}", manifest_path.display()))?;
    let plan = plan_manifest(&manifest, settings)?;
    plan.create_output_dirs()
        .context("Failed to create build directories")?;

    let options = ExecutorOptions::from_settings(settings);
    let compile = plan.compile_tasks(1);
    let next_id = compile.len() as u64 + 1;
    log_options(&options, compile.len());

    let mut report = run_phase("compile", compile, &options, settings, verbose)?;
    if report.success() {
        for (n, wave) in plan.link_waves(next_id).into_iter().enumerate() {
            let name = format!("link wave {}", n + 1);
            let phase = run_phase(&name, wave, &options, settings, verbose)?;
            let ok = phase.success();
            report.extend(phase);
            if !ok {
                break;
            }
        }
    } else {
        warn!("Compilation failed, skipping link");
    }

    finish(&report)?;
    for binary in &plan.binaries {
        info!("Built {}", binary.output_file_path().display());
    }
    Ok(())
}

fn run_phase(
    name: &str,
    tasks: Vec<Task>,
    options: &ExecutorOptions,
    settings: &Settings,
    verbose: bool,
) -> Result<BuildReport> {
    info!(tasks = tasks.len(), "Starting {}", name);
    run_tasks(tasks, options, worker_spawner(settings, verbose)?)
        .with_context(|| format!("Failed to run {}", name))
}

/// `parabuild plan`: print the commands a build would run, as JSON.
pub fn print_plan(manifest_path: &Path, settings: &Settings) -> Result<()> {
    let manifest = Manifest::load(manifest_path)
        .with_context(|| format!("Failed to load {}", manifest_path.display()))?;
    let plan = plan_manifest(&manifest, settings)?;
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

fn plan_manifest(manifest: &Manifest, settings: &Settings) -> Result<BuildPlan> {
    let env = ProbeEnv::from_env();
    let probe = manifest.probe_env(env);
    let cc = detect_compiler(Language::C, &probe).context("No usable C compiler")?;
    let cxx = detect_compiler(Language::Cxx, &probe).context("No usable C++ compiler")?;
    info!("Using C compiler {}", cc);
    info!("Using C++ compiler {}", cxx);

    let config = manifest.compiler_config(cc, cxx, &probe);
    let cx = BuildContext::new(
        manifest.build_path(&settings.build.build_dir),
        manifest.source_path(),
    );
    plan(manifest, &config, &cx).context("Failed to plan build")
}

/// `parabuild detect`: probe for compilers and print what was found.
pub fn detect(cc: bool, cxx: bool) -> Result<()> {
    let languages: Vec<Language> = match (cc, cxx) {
        (true, false) => vec![Language::C],
        (false, true) => vec![Language::Cxx],
        _ => vec![Language::C, Language::Cxx],
    };

    let env = ProbeEnv::from_env();
    for language in languages {
        let vendor = detect_compiler(language, &env)
            .with_context(|| format!("No usable {} compiler", language))?;
        println!("{}: {}", language.env_var(), vendor);
    }
    Ok(())
}

/// `parabuild config show`.
pub fn show_config(settings: &Settings) -> Result<()> {
    print!("{}", settings.to_toml_string()?);
    Ok(())
}

/// `parabuild internal-worker`: serve tasks on stdin/stdout.
pub fn internal_worker(max_frame_bytes: usize) -> Result<()> {
    worker::run_worker_main(FrameCodec::new(max_frame_bytes)).context("Worker failed")
}

fn log_options(options: &ExecutorOptions, tasks: usize) {
    let liveness = match options.liveness {
        LivenessPolicy::Disabled => "off".to_string(),
        LivenessPolicy::Timeout(d) => format!("{}s", d.as_secs()),
    };
    info!(
        tasks,
        jobs = options.jobs,
        keep_going = options.keep_going,
        liveness = %liveness,
        grace_ms = options.shutdown_grace.as_millis() as u64,
        "Run configuration"
    );
}

/// Print failures and turn a failed report into an error.
fn finish(report: &BuildReport) -> Result<()> {
    for failure in report.failures() {
        eprintln!("FAILED: {} ({})", failure.label, failure.status);
        if !failure.stdout.is_empty() {
            eprint!("{}", failure.stdout);
        }
        if !failure.stderr.is_empty() {
            eprint!("{}", failure.stderr);
        }
    }

    info!(
        succeeded = report.succeeded(),
        failed = report.failed(),
        skipped = report.skipped(),
        "Run finished"
    );
    if !report.success() {
        bail!(
            "{} of {} tasks failed, {} skipped",
            report.failed(),
            report.outcomes.len(),
            report.skipped()
        );
    }
    Ok(())
}
