//! CLI entry: the `mao` command tree.
//!
//! Subcommands that belong to the orchestrator core are implemented in the
//! sibling modules; `dashboard`, `update` and `uninstall` are external
//! surfaces and only print a pointer.

pub mod completion;
pub mod feedback_cmd;
pub mod project;
pub mod sessions;
pub mod start;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coordination::ProjectConfig;

use crate::roles::RoleCatalog;
use crate::telemetry;

#[derive(Parser)]
#[command(
    name = "mao",
    version,
    about = "Multi-agent orchestrator: a CTO agent plans, worker agents execute, you approve"
)]
pub struct Cli {
    /// Project directory (defaults to the current directory).
    #[arg(long, global = true, default_value = ".")]
    pub project_dir: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Launch the orchestrator, optionally with an initial task.
    Start(start::StartArgs),
    /// The separate monitoring dashboard (external surface).
    Dashboard,
    /// Initialise `.mao/` for this project.
    Init {
        /// Overwrite an existing configuration.
        #[arg(long)]
        force: bool,
    },
    /// Print the resolved project configuration.
    Config,
    /// List the role catalogue.
    Roles,
    /// Print the version.
    Version,
    /// Self-update (external surface).
    Update,
    /// Uninstall (external surface).
    Uninstall,
    /// List supported languages, or show one language's tooling.
    Languages { lang: Option<String> },
    /// Manage chat sessions.
    Session {
        #[command(subcommand)]
        command: sessions::SessionCommand,
    },
    /// Manage feedback on MAO itself.
    Feedback {
        #[command(subcommand)]
        command: feedback_cmd::FeedbackCommand,
    },
    /// Manage improvements to a target project.
    Project {
        #[command(subcommand)]
        command: project::ProjectCommand,
    },
    /// Generate shell completions.
    Completion(completion::CompletionArgs),
}

/// Language tooling shown by `mao languages`.
pub(crate) const LANGUAGES: &[(&str, &str, &str, &str)] = &[
    // (name, formatter, linter, test framework)
    ("python", "black", "ruff", "pytest"),
    ("typescript", "prettier", "eslint", "vitest"),
    ("rust", "rustfmt", "clippy", "cargo test"),
    ("go", "gofmt", "golangci-lint", "go test"),
];

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = cli
        .project_dir
        .canonicalize()
        .unwrap_or(cli.project_dir.clone());

    match cli.command {
        Command::Start(args) => start::run(&project_dir, args).await,
        Command::Dashboard => {
            telemetry::init_cli("info");
            println!("The dashboard ships separately; attach to the tmux session with:");
            println!("  tmux attach -t mao");
            Ok(())
        }
        Command::Init { force } => {
            telemetry::init_cli("info");
            init_project(&project_dir, force)
        }
        Command::Config => {
            telemetry::init_cli("info");
            let config = ProjectConfig::load(&project_dir)?;
            println!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
        Command::Roles => {
            telemetry::init_cli("info");
            let catalog = RoleCatalog::builtin();
            for role in catalog.iter() {
                println!("{} ({}), default model: {}", role.name, role.display_name, role.model);
                for responsibility in &role.responsibilities {
                    println!("    - {responsibility}");
                }
            }
            Ok(())
        }
        Command::Version => {
            println!("mao {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Update => {
            println!("Update via your package manager; mao does not self-update.");
            Ok(())
        }
        Command::Uninstall => {
            println!("Remove the binary and delete per-project .mao/ directories.");
            Ok(())
        }
        Command::Languages { lang } => {
            telemetry::init_cli("info");
            print_languages(lang.as_deref())
        }
        Command::Session { command } => {
            telemetry::init_cli("info");
            sessions::run(&project_dir, command)
        }
        Command::Feedback { command } => {
            telemetry::init_cli("info");
            feedback_cmd::run(&project_dir, command).await
        }
        Command::Project { command } => {
            telemetry::init_cli("info");
            project::run(&project_dir, command).await
        }
        Command::Completion(args) => completion::run(args),
    }
}

fn init_project(project_dir: &Path, force: bool) -> Result<()> {
    let mao_dir = coordination::mao_dir(project_dir);
    let config_path = mao_dir.join("config.yaml");
    if config_path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }

    let name = project_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "project".to_string());
    let config = ProjectConfig::new(&name);
    config.save(project_dir).context("writing config.yaml")?;

    // Keep orchestrator state out of version control.
    let gitignore = project_dir.join(".gitignore");
    let existing = std::fs::read_to_string(&gitignore).unwrap_or_default();
    if !existing.lines().any(|l| l.trim() == ".mao/") {
        let mut updated = existing;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(".mao/\n");
        std::fs::write(&gitignore, updated).context("updating .gitignore")?;
    }

    println!("initialised {} for project '{name}'", mao_dir.display());
    Ok(())
}

fn print_languages(lang: Option<&str>) -> Result<()> {
    match lang {
        None => {
            for (name, _, _, _) in LANGUAGES {
                println!("{name}");
            }
        }
        Some(wanted) => {
            let Some((name, formatter, linter, tests)) =
                LANGUAGES.iter().find(|(name, _, _, _)| *name == wanted)
            else {
                anyhow::bail!("unsupported language '{wanted}'");
            };
            println!("language: {name}");
            println!("  formatter: {formatter}");
            println!("  linter: {linter}");
            println!("  tests: {tests}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_init_creates_config_and_gitignore() {
        let dir = tempfile::tempdir().unwrap();
        init_project(dir.path(), false).unwrap();
        assert!(dir.path().join(".mao/config.yaml").exists());
        let gitignore = std::fs::read_to_string(dir.path().join(".gitignore")).unwrap();
        assert!(gitignore.contains(".mao/"));

        // Second init without --force refuses.
        assert!(init_project(dir.path(), false).is_err());
        // With --force it overwrites.
        init_project(dir.path(), true).unwrap();
        // .gitignore entry is not duplicated.
        let gitignore = std::fs::read_to_string(dir.path().join(".gitignore")).unwrap();
        assert_eq!(gitignore.matches(".mao/").count(), 1);
    }

    #[test]
    fn test_languages_table() {
        print_languages(None).unwrap();
        print_languages(Some("rust")).unwrap();
        assert!(print_languages(Some("cobol")).is_err());
    }
}
