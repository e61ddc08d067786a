//! A fake host that interprets the shell commands servectl emits
//!
//! [`SimulatedHost`] keeps a process table with listening ports and GPU
//! allocations, a small file system and a set of installed tools, and
//! answers the probe, kill, launch and lookup commands used by the
//! accelerator handlers and the lifecycle manager. Anything it does not
//! understand exits 127, like a missing binary.

use async_trait::async_trait;
use regex::Regex;
use serve_core::{ExecOptions, ExecutionResult, ExecutionTarget, HostIdentity};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{LazyLock, Mutex, MutexGuard};

static LAUNCH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^nohup sh -c '(.*)' > (.+?) 2>&1 < /dev/null & echo \$!$").expect("valid regex")
});
static KILL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^kill -(\w+) (\d+)").expect("valid regex"));
static TAIL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^tail -n (\d+) (.+?) 2>/dev/null$").expect("valid regex"));
static PORT_OWNER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^ss -ltnpH 'sport = :(\d+)'").expect("valid regex"));
static PROFILE_TOOL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"command -v ([\w.-]+)'").expect("valid regex"));
static QUOTED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#""([^"]+)""#).expect("valid regex"));
static SIBLING_TOOL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"\$d/\.\./bin/([\w.-]+)""#).expect("valid regex"));

pub const FREE_OUTPUT: &str = "\
              total        used        free      shared  buff/cache   available
Mem:    67430559744 12884901888 41875931136    10485760 12669726720 53687091200
Swap:    8589930496           0  8589930496
";

pub const DF_OUTPUT: &str = "\
Filesystem         1-blocks         Used    Available Capacity Mounted on
/dev/nvme0n1p2 1967317618688 524288000000 1343029618688      29% /
tmpfs            33715277824            0   33715277824       0% /dev/shm
";

/// What a launched command does
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LaunchBehavior {
    /// Keep running and listen on the port from its arguments
    #[default]
    Listen,
    /// Keep running without opening the port
    NoListen,
    /// Exit immediately after writing `log`
    Exit { log: String },
}

/// A process on the simulated host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimProcess {
    pub pid: u32,
    pub ppid: u32,
    pub args: String,
    pub ports: Vec<u16>,
    /// Device index and memory in MiB
    pub gpu: Option<(u32, u64)>,
    /// Survives SIGTERM
    pub ignores_term: bool,
    /// Exits when its parent is terminated
    pub dies_with_parent: bool,
}

impl SimProcess {
    pub fn new(pid: u32, args: impl Into<String>) -> Self {
        Self {
            pid,
            ppid: 1,
            args: args.into(),
            ports: Vec::new(),
            gpu: None,
            ignores_term: false,
            dies_with_parent: false,
        }
    }

    pub fn child_of(mut self, ppid: u32) -> Self {
        self.ppid = ppid;
        self
    }

    pub fn listening_on(mut self, port: u16) -> Self {
        self.ports.push(port);
        self
    }

    pub fn on_gpu(mut self, index: u32, memory_mb: u64) -> Self {
        self.gpu = Some((index, memory_mb));
        self
    }

    pub fn ignoring_term(mut self) -> Self {
        self.ignores_term = true;
        self
    }

    pub fn dying_with_parent(mut self) -> Self {
        self.dies_with_parent = true;
        self
    }

    fn name(&self) -> &str {
        self.args.split_whitespace().next().unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
struct SimGpu {
    name: String,
    memory_total_mb: u64,
}

#[derive(Default)]
struct State {
    processes: BTreeMap<u32, SimProcess>,
    next_pid: u32,
    files: HashMap<String, String>,
    dirs: BTreeSet<String>,
    executables: BTreeSet<String>,
    path_tools: HashMap<String, String>,
    profile_tools: HashMap<String, String>,
    env_dirs: Vec<String>,
    gpus: Vec<SimGpu>,
    launch: LaunchBehavior,
    launch_gpu_mb: u64,
    overrides: Vec<(String, ExecutionResult)>,
    calls: Vec<String>,
}

impl State {
    fn allocate_pid(&mut self) -> u32 {
        self.next_pid += 1;
        while self.processes.contains_key(&self.next_pid) {
            self.next_pid += 1;
        }
        self.next_pid
    }

    /// Remove `pid` and any children that exit with it
    fn terminate(&mut self, pid: u32) {
        self.processes.remove(&pid);
        let orphans: Vec<u32> = self
            .processes
            .values()
            .filter(|p| p.ppid == pid && p.dies_with_parent)
            .map(|p| p.pid)
            .collect();
        for orphan in orphans {
            self.terminate(orphan);
        }
    }
}

fn ok(stdout: impl Into<String>) -> ExecutionResult {
    ExecutionResult::ok(stdout)
}

fn exit(code: i32, stderr: impl Into<String>) -> ExecutionResult {
    ExecutionResult::from_exit(code, "", stderr)
}

fn not_found(command: &str) -> ExecutionResult {
    let program = command.split_whitespace().next().unwrap_or_default();
    exit(127, format!("sh: 1: {}: not found", program))
}

fn port_argument(tokens: &[&str]) -> Option<u16> {
    tokens.iter().enumerate().find_map(|(i, token)| match *token {
        "--port" | "-p" => tokens.get(i + 1).and_then(|p| p.parse().ok()),
        other => other.strip_prefix("--port=").and_then(|p| p.parse().ok()),
    })
}

/// In-memory host for lifecycle and accelerator tests
pub struct SimulatedHost {
    identity: HostIdentity,
    home: String,
    state: Mutex<State>,
}

impl SimulatedHost {
    pub fn new() -> Self {
        Self::with_identity(HostIdentity::remote("sim-host", 22, "ml"))
    }

    pub fn with_identity(identity: HostIdentity) -> Self {
        let home = format!("/home/{}", identity.username);
        let mut state = State {
            next_pid: 1000,
            launch_gpu_mb: 2048,
            ..State::default()
        };
        state.processes.insert(1, SimProcess::new(1, "/sbin/init").child_of(0));
        state.dirs.insert(home.clone());
        Self {
            identity,
            home,
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn home(&self) -> &str {
        &self.home
    }

    pub fn with_gpu(self, name: impl Into<String>, memory_total_mb: u64) -> Self {
        self.state().gpus.push(SimGpu {
            name: name.into(),
            memory_total_mb,
        });
        self
    }

    /// `tool` resolves through `command -v` in a plain shell
    pub fn with_tool_on_path(self, tool: impl Into<String>, path: impl Into<String>) -> Self {
        let path = path.into();
        {
            let mut state = self.state();
            state.executables.insert(path.clone());
            state.path_tools.insert(tool.into(), path);
        }
        self
    }

    /// `tool` resolves only after sourcing the shell profiles
    pub fn with_tool_in_profile(self, tool: impl Into<String>, path: impl Into<String>) -> Self {
        let path = path.into();
        {
            let mut state = self.state();
            state.executables.insert(path.clone());
            state.profile_tools.insert(tool.into(), path);
        }
        self
    }

    pub fn with_executable(self, path: impl Into<String>) -> Self {
        self.state().executables.insert(path.into());
        self
    }

    /// An `envs/` directory, e.g. `/home/ml/miniforge3/envs`
    pub fn with_env_dir(self, dir: impl Into<String>) -> Self {
        self.state().env_dirs.push(dir.into());
        self
    }

    pub fn with_file(self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.state().files.insert(path.into(), content.into());
        self
    }

    pub fn with_launch_behavior(self, behavior: LaunchBehavior) -> Self {
        self.state().launch = behavior;
        self
    }

    pub fn with_process(self, process: SimProcess) -> Self {
        self.insert(process);
        self
    }

    /// Commands containing `pattern` get `result` instead of being
    /// interpreted
    pub fn override_command(self, pattern: impl Into<String>, result: ExecutionResult) -> Self {
        self.state().overrides.push((pattern.into(), result));
        self
    }

    pub fn set_launch_behavior(&self, behavior: LaunchBehavior) {
        self.state().launch = behavior;
    }

    /// Remove `pid` as if it crashed
    pub fn kill(&self, pid: u32) -> bool {
        let mut state = self.state();
        let existed = state.processes.contains_key(&pid);
        state.terminate(pid);
        existed
    }

    pub fn insert(&self, process: SimProcess) {
        self.state().processes.insert(process.pid, process);
    }

    /// Start a process under init and return its pid
    pub fn spawn(&self, args: impl Into<String>) -> u32 {
        let mut state = self.state();
        let pid = state.allocate_pid();
        state.processes.insert(pid, SimProcess::new(pid, args));
        pid
    }

    pub fn is_running(&self, pid: u32) -> bool {
        self.state().processes.contains_key(&pid)
    }

    pub fn process(&self, pid: u32) -> Option<SimProcess> {
        self.state().processes.get(&pid).cloned()
    }

    pub fn processes(&self) -> Vec<SimProcess> {
        self.state().processes.values().cloned().collect()
    }

    pub fn is_listening(&self, port: u16) -> bool {
        self.state().processes.values().any(|p| p.ports.contains(&port))
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.state().files.get(path).cloned()
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.state().dirs.contains(path)
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn calls_matching(&self, pattern: &str) -> usize {
        self.state().calls.iter().filter(|c| c.contains(pattern)).count()
    }

    /// Undo the shell quoting servectl applies to paths
    fn normalize_path(&self, raw: &str) -> String {
        raw.trim()
            .replace("\"$HOME\"", &self.home)
            .replace("$HOME", &self.home)
            .replace(['\'', '"'], "")
    }

    fn interpret(&self, command: &str) -> ExecutionResult {
        let command = command.trim();
        let mut state = self.state();
        state.calls.push(command.to_string());

        if let Some((_, result)) = state.overrides.iter().find(|(pattern, _)| command.contains(pattern)) {
            return result.clone();
        }

        if command.starts_with("command -v nvidia-smi") {
            return self.nvidia_probe(&state);
        }
        if command.starts_with("nvidia-smi --query-gpu") {
            return self.nvidia_devices(&state);
        }
        if command.starts_with("nvidia-smi --query-compute-apps") {
            return self.nvidia_processes(&state);
        }
        if command.starts_with("nvidia-smi") && !state.gpus.is_empty() {
            return ok("");
        }
        if let Some(rest) = command.strip_prefix("command -v ") {
            // vendor probes chain the tool itself, which is not simulated
            if command.contains("&&") {
                return exit(1, "");
            }
            let tool = rest.split_whitespace().next().unwrap_or_default();
            return match state.path_tools.get(tool) {
                Some(path) => ok(format!("{}\n", path)),
                None => exit(1, ""),
            };
        }
        if command.starts_with("bash -lc") {
            let tool = PROFILE_TOOL.captures(command).map(|c| c[1].to_string()).unwrap_or_default();
            return match state.profile_tools.get(&tool).or_else(|| state.path_tools.get(&tool)) {
                Some(path) => ok(format!("{}\n", path)),
                None => exit(1, ""),
            };
        }
        if command.starts_with("for p in ") {
            let found = QUOTED
                .captures_iter(command)
                .map(|c| c[1].replace("$HOME", &self.home))
                .find(|candidate| state.executables.contains(candidate));
            return ok(found.map(|p| format!("{}\n", p)).unwrap_or_default());
        }
        if command.starts_with("for d in ") {
            let tool = SIBLING_TOOL.captures(command).map(|c| c[1].to_string()).unwrap_or_default();
            let found = state
                .env_dirs
                .iter()
                .map(|dir| format!("{}/bin/{}", dir.trim_end_matches('/').trim_end_matches("/envs"), tool))
                .find(|candidate| state.executables.contains(candidate));
            return ok(found.map(|p| format!("{}\n", p)).unwrap_or_default());
        }
        if command == "ps -eo pid=,ppid=,args=" {
            let table: String = state
                .processes
                .values()
                .map(|p| format!("{:>5} {:>5} {}\n", p.pid, p.ppid, p.args))
                .collect();
            return ok(table);
        }
        if let Some(rest) = command.strip_prefix("ps -o pid=,args= -p ") {
            let pids: Vec<u32> = rest
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .split(',')
                .filter_map(|p| p.parse().ok())
                .collect();
            let rows: String = pids
                .iter()
                .filter_map(|pid| state.processes.get(pid))
                .map(|p| format!("{:>5} {}\n", p.pid, p.args))
                .collect();
            return ok(rows);
        }
        if command.starts_with("(ss -ltnH") {
            let rows: String = state
                .processes
                .values()
                .flat_map(|p| p.ports.iter())
                .map(|port| format!("LISTEN 0      4096         0.0.0.0:{}      0.0.0.0:*\n", port))
                .collect();
            return ok(rows);
        }
        if let Some(caps) = PORT_OWNER.captures(command) {
            let port: u16 = caps[1].parse().unwrap_or_default();
            let rows: String = state
                .processes
                .values()
                .filter(|p| p.ports.contains(&port))
                .map(|p| {
                    format!(
                        "LISTEN 0 4096 0.0.0.0:{} 0.0.0.0:* users:((\"{}\",pid={},fd=7))\n",
                        port,
                        p.name(),
                        p.pid
                    )
                })
                .collect();
            return ok(rows);
        }
        if let Some(caps) = KILL.captures(command) {
            let signal = caps[1].to_string();
            let pid: u32 = caps[2].parse().unwrap_or_default();
            let Some(process) = state.processes.get(&pid).cloned() else {
                return exit(1, "");
            };
            match signal.as_str() {
                "0" => {}
                "TERM" if process.ignores_term => {}
                _ => state.terminate(pid),
            }
            return ok("ok\n");
        }
        if let Some(rest) = command.strip_prefix("mkdir -p ") {
            let dir = self.normalize_path(rest);
            state.dirs.insert(dir);
            return ok("");
        }
        if let Some(caps) = TAIL.captures(command) {
            let lines: usize = caps[1].parse().unwrap_or_default();
            let path = self.normalize_path(&caps[2]);
            return match state.files.get(&path) {
                Some(content) => {
                    let all: Vec<&str> = content.lines().collect();
                    let start = all.len().saturating_sub(lines);
                    ok(all[start..].iter().map(|l| format!("{}\n", l)).collect::<String>())
                }
                None => exit(1, ""),
            };
        }
        if let Some(caps) = LAUNCH.captures(command) {
            let inner = caps[1].replace(r"'\''", "'");
            let log_path = self.normalize_path(&caps[2]);
            return self.launch(&mut state, &inner, log_path);
        }
        if command.starts_with("free -b") {
            return ok(FREE_OUTPUT);
        }
        if command.starts_with("df -P -B1") {
            return ok(DF_OUTPUT);
        }
        if command == "echo ok" {
            return ok("ok\n");
        }
        not_found(command)
    }

    fn launch(&self, state: &mut State, inner: &str, log_path: String) -> ExecutionResult {
        let run = inner.rsplit(" && ").next().unwrap_or(inner);
        let run = run.strip_prefix("exec ").unwrap_or(run);
        let unquoted = self.normalize_path(run);
        let tokens: Vec<&str> = unquoted.split_whitespace().collect();

        // `<tool> run --no-capture-output -n <env> <command>`
        let wrapper = tokens.first().is_some_and(|first| {
            let name = first.rsplit('/').next().unwrap_or(first);
            matches!(name, "conda" | "mamba" | "micromamba") && tokens.get(1) == Some(&"run")
        });
        let server_args = if wrapper {
            let mut i = 2;
            while let Some(token) = tokens.get(i) {
                match *token {
                    "-n" | "-p" | "--name" | "--prefix" => i += 2,
                    flag if flag.starts_with('-') => i += 1,
                    _ => break,
                }
            }
            tokens[i.min(tokens.len())..].join(" ")
        } else {
            tokens.join(" ")
        };
        let port = port_argument(&server_args.split_whitespace().collect::<Vec<_>>());

        let launched = state.allocate_pid();
        let behavior = state.launch.clone();
        if let LaunchBehavior::Exit { log } = behavior {
            state.files.insert(log_path, log);
            return ok(format!("{}\n", launched));
        }

        let server_pid = if wrapper {
            state.processes.insert(launched, SimProcess::new(launched, unquoted.clone()));
            state.allocate_pid()
        } else {
            launched
        };
        let mut server = SimProcess::new(server_pid, server_args);
        if wrapper {
            server = server.child_of(launched).dying_with_parent();
        }
        if !state.gpus.is_empty() {
            server = server.on_gpu(0, state.launch_gpu_mb);
        }
        let mut log = String::from("INFO: loading application\n");
        if let (LaunchBehavior::Listen, Some(port)) = (&state.launch, port) {
            server = server.listening_on(port);
            log.push_str(&format!("INFO: Uvicorn running on http://0.0.0.0:{}\n", port));
        }
        state.processes.insert(server_pid, server);
        state.files.insert(log_path, log);
        ok(format!("{}\n", launched))
    }

    fn nvidia_probe(&self, state: &State) -> ExecutionResult {
        if state.gpus.is_empty() {
            return exit(1, "");
        }
        ok(state
            .gpus
            .iter()
            .enumerate()
            .map(|(i, gpu)| format!("GPU {}: {} (UUID: GPU-sim-{})\n", i, gpu.name, i))
            .collect::<String>())
    }

    fn nvidia_devices(&self, state: &State) -> ExecutionResult {
        if state.gpus.is_empty() {
            return not_found("nvidia-smi");
        }
        ok(state
            .gpus
            .iter()
            .enumerate()
            .map(|(i, gpu)| {
                let used: u64 = state
                    .processes
                    .values()
                    .filter_map(|p| p.gpu)
                    .filter(|(index, _)| *index as usize == i)
                    .map(|(_, mb)| mb)
                    .sum();
                let utilization = if used > 0 { 85 } else { 0 };
                format!(
                    "{}, GPU-sim-{}, {}, {}, {}, {}, 45\n",
                    i, i, gpu.name, gpu.memory_total_mb, used, utilization
                )
            })
            .collect::<String>())
    }

    fn nvidia_processes(&self, state: &State) -> ExecutionResult {
        if state.gpus.is_empty() {
            return not_found("nvidia-smi");
        }
        ok(state
            .processes
            .values()
            .filter_map(|p| p.gpu.map(|(index, mb)| format!("{}, GPU-sim-{}, {}, {}\n", p.pid, index, p.name(), mb)))
            .collect::<String>())
    }
}

impl Default for SimulatedHost {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionTarget for SimulatedHost {
    fn identity(&self) -> &HostIdentity {
        &self.identity
    }

    async fn execute(&self, command: &str, options: &ExecOptions) -> ExecutionResult {
        let mut result = self.interpret(command);
        result.stdout = options.limit_output(result.stdout);
        result
    }
}
