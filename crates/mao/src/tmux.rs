//! tmux driver: one session, a CTO pane plus N agent panes in a tiled grid.
//!
//! The driver only moves bytes in and out of panes: starting the LLM,
//! sending keystrokes, teeing output to log files, capturing scrollback.
//! Interpreting what agents print is the supervisor's job.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use coordination::{MaoError, MaoResult};
use tracing::{info, warn};

use crate::exec::{self, SHORT_TIMEOUT};

/// Shells considered idle when they are a pane's foreground command.
const IDLE_SHELLS: &[&str] = &["bash", "zsh", "sh", "fish", "ksh"];

/// Prompts below this length are typed straight into the pane; longer ones
/// go through a temp file the LLM is told to read.
const INLINE_PROMPT_LIMIT: usize = 500;

/// Foreground state of one pane.
#[derive(Debug, Clone, Default)]
pub struct PaneStatus {
    pub current_command: Option<String>,
    pub pid: Option<u32>,
    pub active: bool,
    pub dead: bool,
    pub busy: bool,
}

/// Parse the `#{pane_current_command}|||#{pane_pid}|||#{pane_active}|||#{pane_dead}`
/// format line from `display-message`.
fn parse_status_line(line: &str) -> Option<PaneStatus> {
    let parts: Vec<&str> = line.trim().split("|||").collect();
    if parts.len() < 4 {
        return None;
    }
    let command = parts[0].trim();
    Some(PaneStatus {
        current_command: (!command.is_empty()).then(|| command.to_string()),
        pid: parts[1].trim().parse().ok(),
        active: parts[2].trim() == "1",
        dead: parts[3].trim() == "1",
        busy: !command.is_empty() && !IDLE_SHELLS.contains(&command),
    })
}

/// Grid slot names: the CTO pane followed by `agent-1` … `agent-N`.
fn slot_names(num_agents: usize) -> Vec<String> {
    let mut names = vec!["cto".to_string()];
    names.extend((1..=num_agents).map(|i| format!("agent-{i}")));
    names
}

fn quote(value: &str) -> MaoResult<String> {
    shlex::try_quote(value)
        .map(|q| q.to_string())
        .map_err(|_| MaoError::validation("value cannot be shell-quoted (embedded NUL)"))
}

/// Temp file used to hand a long prompt to the pane's LLM.
fn prompt_file_for_pane(pane_id: &str) -> PathBuf {
    let safe = pane_id.replace([':', '.', '%'], "_");
    std::env::temp_dir().join(format!(".mao_prompt_{safe}.txt"))
}

/// Manages the tmux session and the agent → pane bindings.
pub struct TmuxManager {
    session_name: String,
    grid_width: u16,
    grid_height: u16,
    num_agents: usize,
    /// Grid slot name → pane target (`session:0.idx`).
    grid_panes: Mutex<HashMap<String, String>>,
    /// Agent id → grid slot currently bound to it.
    bindings: Mutex<HashMap<String, String>>,
}

impl TmuxManager {
    pub fn new(session_name: &str, grid_width: u16, grid_height: u16, num_agents: usize) -> Self {
        Self {
            session_name: session_name.to_string(),
            grid_width,
            grid_height,
            num_agents,
            grid_panes: Mutex::new(HashMap::new()),
            bindings: Mutex::new(HashMap::new()),
        }
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    pub async fn is_available(&self) -> bool {
        exec::is_available("tmux", "-V").await
    }

    pub async fn session_exists(&self) -> bool {
        exec::run(
            "tmux",
            &["has-session", "-t", &self.session_name],
            None,
            SHORT_TIMEOUT,
        )
        .await
        .map(|out| out.status.success())
        .unwrap_or(false)
    }

    async fn tmux(&self, args: &[&str]) -> MaoResult<String> {
        exec::run_checked("tmux", args, None, SHORT_TIMEOUT).await
    }

    fn pane_target(&self, index: usize) -> String {
        format!("{}:0.{index}", self.session_name)
    }

    fn register_grid(&self) {
        let mut grid = self
            .grid_panes
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        grid.clear();
        for (index, name) in slot_names(self.num_agents).into_iter().enumerate() {
            grid.insert(name, self.pane_target(index));
        }
    }

    /// Create the session with its tiled grid. Idempotent: succeeds when
    /// the session already exists.
    pub async fn create_session(&self) -> MaoResult<()> {
        if self.session_exists().await {
            info!(session = %self.session_name, "tmux session already exists");
            self.register_grid();
            return Ok(());
        }

        let width = self.grid_width.to_string();
        let height = self.grid_height.to_string();
        self.tmux(&[
            "new-session",
            "-d",
            "-s",
            &self.session_name,
            "-n",
            "multiagent",
            "-x",
            &width,
            "-y",
            &height,
        ])
        .await?;

        // Pane titles on the borders, so the operator can tell agents apart.
        self.tmux(&[
            "set-option",
            "-t",
            &self.session_name,
            "pane-border-status",
            "top",
        ])
        .await?;
        self.tmux(&[
            "set-option",
            "-t",
            &self.session_name,
            "pane-border-format",
            " #{pane_title} ",
        ])
        .await?;

        // 3×3 grid: split into three rows, then split each row into three
        // columns, then even everything out.
        let window = format!("{}:0", self.session_name);
        let first = self.pane_target(0);
        self.tmux(&["split-window", "-v", "-t", &first]).await?;
        self.tmux(&["split-window", "-v", "-t", &first]).await?;
        for row_head in [0, 1, 3, 4, 6, 7] {
            let target = self.pane_target(row_head);
            self.tmux(&["split-window", "-h", "-t", &target]).await?;
        }
        self.tmux(&["select-layout", "-t", &window, "tiled"]).await?;

        self.register_grid();

        for (slot, pane) in self
            .grid_panes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            let title = if slot == "cto" {
                "CTO".to_string()
            } else {
                slot.to_uppercase()
            };
            self.tmux(&["select-pane", "-t", &pane, "-T", &title]).await?;
            self.send_keys(&pane, "clear").await?;
        }

        info!(session = %self.session_name, agents = self.num_agents, "tmux session created");
        Ok(())
    }

    /// Pane target of a grid slot (`cto`, `agent-3`, ...).
    pub fn pane_for_slot(&self, slot: &str) -> Option<String> {
        self.grid_panes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(slot)
            .cloned()
    }

    /// Claim a free agent slot for `agent_id`; returns (slot, pane target).
    pub fn claim_slot(&self, agent_id: &str) -> MaoResult<(String, String)> {
        let grid = self
            .grid_panes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let mut bindings = self.bindings.lock().unwrap_or_else(|e| e.into_inner());
        let taken: std::collections::HashSet<String> = bindings.values().cloned().collect();

        for index in 1..=self.num_agents {
            let slot = format!("agent-{index}");
            if taken.contains(&slot) {
                continue;
            }
            if let Some(pane) = grid.get(&slot) {
                bindings.insert(agent_id.to_string(), slot.clone());
                return Ok((slot, pane.clone()));
            }
        }
        Err(MaoError::process(format!(
            "no free agent pane for {agent_id} ({} slots)",
            self.num_agents
        )))
    }

    /// Release an agent's slot back to the idle pool. Idempotent: cleanup
    /// paths may race to release the same binding.
    pub fn release_slot(&self, agent_id: &str) {
        let mut bindings = self.bindings.lock().unwrap_or_else(|e| e.into_inner());
        if bindings.remove(agent_id).is_some() {
            info!(agent_id, "pane released");
        }
    }

    /// Slot currently bound to `agent_id`.
    pub fn slot_of(&self, agent_id: &str) -> Option<String> {
        self.bindings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(agent_id)
            .cloned()
    }

    /// Bind an agent to a grid slot: move the pane to its working
    /// directory, enable log teeing, print a banner.
    pub async fn assign(
        &self,
        slot: &str,
        agent_id: &str,
        work_dir: &Path,
        log_file: Option<&Path>,
    ) -> MaoResult<String> {
        let pane = self.pane_for_slot(slot).ok_or_else(|| {
            MaoError::validation(format!("slot '{slot}' not present in the grid"))
        })?;

        self.send_keys(&pane, "clear").await?;
        let cd = format!("cd {}", quote(&work_dir.display().to_string())?);
        self.send_keys(&pane, &cd).await?;

        if let Some(log_file) = log_file {
            self.enable_logging(&pane, log_file).await?;
        }

        let banner = format!("echo 'agent {agent_id} ready in {slot}'");
        self.send_keys(&pane, &banner).await?;

        info!(agent_id, slot, pane = %pane, "agent assigned to pane");
        Ok(pane)
    }

    /// Start the interactive LLM in a pane (no `--print`).
    pub async fn start_interactive_llm(
        &self,
        pane_id: &str,
        model: &str,
        work_dir: Option<&Path>,
        allow_unsafe: bool,
    ) -> MaoResult<()> {
        let mut command = format!("claude --model {}", quote(model)?);
        if allow_unsafe {
            command.push_str(" --dangerously-skip-permissions");
        }
        if let Some(work_dir) = work_dir {
            command.push_str(&format!(
                " --add-dir {}",
                quote(&work_dir.display().to_string())?
            ));
        }
        self.send_keys(pane_id, &command).await?;
        info!(pane = pane_id, model, "interactive llm started");
        Ok(())
    }

    /// Send a prompt to the interactive LLM in a pane.
    ///
    /// Short prompts are typed directly (newlines collapsed; the newline
    /// is the submission). Long prompts are written to a temp file and the
    /// LLM is instructed to read it.
    pub async fn send_prompt(&self, pane_id: &str, prompt: &str) -> MaoResult<()> {
        if prompt.len() < INLINE_PROMPT_LIMIT {
            let inline = prompt.replace('\n', " ");
            self.send_keys(pane_id, &inline).await?;
        } else {
            let prompt_file = prompt_file_for_pane(pane_id);
            std::fs::write(&prompt_file, prompt)?;
            let instruction = format!(
                "Please read and follow the instructions in {}",
                prompt_file.display()
            );
            self.send_keys(pane_id, &instruction).await?;
        }
        info!(pane = pane_id, bytes = prompt.len(), "prompt sent");
        Ok(())
    }

    /// Send a line of keystrokes followed by Enter.
    pub async fn send_keys(&self, pane_id: &str, text: &str) -> MaoResult<()> {
        self.tmux(&["send-keys", "-t", pane_id, text, "C-m"]).await?;
        Ok(())
    }

    /// Tail of the pane's scrollback.
    pub async fn capture_pane(&self, pane_id: &str, lines: usize) -> MaoResult<String> {
        let start = format!("-{lines}");
        let output = exec::run(
            "tmux",
            &["capture-pane", "-p", "-t", pane_id, "-S", &start],
            None,
            SHORT_TIMEOUT,
        )
        .await?;
        if !output.status.success() {
            return Err(MaoError::subprocess(
                "tmux capture-pane",
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Foreground command, pid and busy state of a pane.
    pub async fn pane_status(&self, pane_id: &str) -> PaneStatus {
        let result = self
            .tmux(&[
                "display-message",
                "-p",
                "-t",
                pane_id,
                "#{pane_current_command}|||#{pane_pid}|||#{pane_active}|||#{pane_dead}",
            ])
            .await;
        match result {
            Ok(line) => parse_status_line(&line).unwrap_or_else(|| PaneStatus {
                dead: true,
                ..PaneStatus::default()
            }),
            Err(e) => {
                warn!(pane = pane_id, error = %e, "pane status unavailable");
                PaneStatus {
                    dead: true,
                    ..PaneStatus::default()
                }
            }
        }
    }

    /// Whether something other than an idle shell runs in the pane.
    pub async fn is_pane_busy(&self, pane_id: &str) -> bool {
        self.pane_status(pane_id).await.busy
    }

    /// Tee everything the pane displays into `log_file` (append mode).
    pub async fn enable_logging(&self, pane_id: &str, log_file: &Path) -> MaoResult<()> {
        let tee = format!("tee -a {}", quote(&log_file.display().to_string())?);
        self.tmux(&["pipe-pane", "-t", pane_id, "-o", &tee]).await?;
        info!(pane = pane_id, log = %log_file.display(), "pane logging enabled");
        Ok(())
    }

    /// Remove the pane's output pipe.
    pub async fn disable_logging(&self, pane_id: &str) -> MaoResult<()> {
        self.tmux(&["pipe-pane", "-t", pane_id]).await?;
        info!(pane = pane_id, "pane logging disabled");
        Ok(())
    }

    pub async fn destroy_session(&self) -> MaoResult<()> {
        if !self.session_exists().await {
            return Ok(());
        }
        self.tmux(&["kill-session", "-t", &self.session_name]).await?;
        info!(session = %self.session_name, "tmux session destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_names() {
        let names = slot_names(3);
        assert_eq!(names, vec!["cto", "agent-1", "agent-2", "agent-3"]);
    }

    #[test]
    fn test_parse_status_line() {
        let status = parse_status_line("claude|||4242|||1|||0").unwrap();
        assert_eq!(status.current_command.as_deref(), Some("claude"));
        assert_eq!(status.pid, Some(4242));
        assert!(status.active);
        assert!(!status.dead);
        assert!(status.busy);

        let idle = parse_status_line("zsh|||100|||0|||0").unwrap();
        assert!(!idle.busy);

        assert!(parse_status_line("garbage").is_none());
    }

    #[test]
    fn test_prompt_file_name_is_pane_safe() {
        let path = prompt_file_for_pane("mao:0.3");
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert_eq!(name, ".mao_prompt_mao_0_3.txt");
    }

    #[test]
    fn test_claim_and_release_slots() {
        let manager = TmuxManager::new("mao-test", 240, 60, 2);
        manager.register_grid();

        let (slot_a, pane_a) = manager.claim_slot("agent-aaa").unwrap();
        assert_eq!(slot_a, "agent-1");
        assert_eq!(pane_a, "mao-test:0.1");

        let (slot_b, _) = manager.claim_slot("agent-bbb").unwrap();
        assert_eq!(slot_b, "agent-2");

        // Grid exhausted.
        assert!(manager.claim_slot("agent-ccc").is_err());

        // No two agents share a pane.
        assert_ne!(manager.slot_of("agent-aaa"), manager.slot_of("agent-bbb"));

        manager.release_slot("agent-aaa");
        let (slot_c, _) = manager.claim_slot("agent-ccc").unwrap();
        assert_eq!(slot_c, "agent-1");
    }

    #[test]
    fn test_pane_for_slot() {
        let manager = TmuxManager::new("mao-test", 240, 60, 4);
        manager.register_grid();
        assert_eq!(manager.pane_for_slot("cto").unwrap(), "mao-test:0.0");
        assert_eq!(manager.pane_for_slot("agent-4").unwrap(), "mao-test:0.4");
        assert!(manager.pane_for_slot("agent-9").is_none());
    }
}
