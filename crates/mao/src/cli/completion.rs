//! `mao completion`: shell completion generation and installation.

use std::io::Write;

use anyhow::{bail, Context, Result};
use clap::{Args, CommandFactory};
use clap_complete::Shell;

use crate::cli::Cli;

#[derive(Args)]
pub struct CompletionArgs {
    /// Target shell; inferred from $SHELL when omitted.
    pub shell: Option<Shell>,

    /// Append the completion script to the shell's rc file.
    #[arg(long)]
    pub install: bool,
}

fn detect_shell() -> Option<Shell> {
    let shell = std::env::var("SHELL").ok()?;
    let name = shell.rsplit('/').next()?;
    match name {
        "bash" => Some(Shell::Bash),
        "zsh" => Some(Shell::Zsh),
        "fish" => Some(Shell::Fish),
        _ => None,
    }
}

fn rc_file(shell: Shell) -> Option<std::path::PathBuf> {
    let home = std::env::var_os("HOME").map(std::path::PathBuf::from)?;
    match shell {
        Shell::Bash => Some(home.join(".bashrc")),
        Shell::Zsh => Some(home.join(".zshrc")),
        Shell::Fish => Some(home.join(".config/fish/completions/mao.fish")),
        _ => None,
    }
}

pub fn run(args: CompletionArgs) -> Result<()> {
    let Some(shell) = args.shell.or_else(detect_shell) else {
        bail!("could not detect shell; pass one of bash, zsh, fish");
    };

    let mut command = Cli::command();
    let mut script = Vec::new();
    clap_complete::generate(shell, &mut command, "mao", &mut script);

    if !args.install {
        std::io::stdout().write_all(&script)?;
        return Ok(());
    }

    let Some(rc) = rc_file(shell) else {
        bail!("no install target known for {shell}");
    };
    if let Some(parent) = rc.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&rc)
        .with_context(|| format!("opening {}", rc.display()))?;
    file.write_all(b"\n# mao shell completion\n")?;
    file.write_all(&script)?;
    println!("installed completion for {shell} into {}", rc.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_produces_a_script() {
        let mut command = Cli::command();
        let mut script = Vec::new();
        clap_complete::generate(Shell::Bash, &mut command, "mao", &mut script);
        let text = String::from_utf8(script).unwrap();
        assert!(text.contains("mao"));
    }

    #[test]
    fn test_rc_file_targets() {
        std::env::set_var("HOME", "/home/test");
        assert!(rc_file(Shell::Bash).unwrap().ends_with(".bashrc"));
        assert!(rc_file(Shell::Fish)
            .unwrap()
            .ends_with(".config/fish/completions/mao.fish"));
    }
}
