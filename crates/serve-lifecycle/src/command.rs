//! Start-command cleaning and signature extraction
//!
//! A user's start command is shell text: environment exports, activation
//! steps, interpreter-run wrappers, backgrounding and redirections around
//! the actual server invocation. [`ParsedCommand::parse`] strips that
//! wrapper syntax down to the clean command and pulls out what the
//! lifecycle needs to recognise the process later.

use crate::{LifecycleError, Result};
use serde::{Deserialize, Serialize};

/// Frameworks recognised by keyword, most specific first
pub const FRAMEWORKS: &[&str] = &[
    "text-generation-launcher",
    "llama-server",
    "tritonserver",
    "lmdeploy",
    "sglang",
    "vllm",
    "ollama",
    "xinference",
    "llama.cpp",
];

/// Environment variables that restrict accelerator visibility
pub const VISIBILITY_VARS: &[&str] = &[
    "CUDA_VISIBLE_DEVICES",
    "NVIDIA_VISIBLE_DEVICES",
    "HIP_VISIBLE_DEVICES",
    "ROCR_VISIBLE_DEVICES",
    "ZE_AFFINITY_MASK",
    "ONEAPI_DEVICE_SELECTOR",
];

const PORT_FLAGS: &[&str] = &["--port", "--server-port", "--http-port", "--listen-port", "--api-port", "-p"];

const MODEL_FLAGS: &[&str] = &[
    "--model",
    "--model-path",
    "--model_path",
    "--model-id",
    "--model-dir",
    "--model-repository",
    "-m",
];

const RUN_WRAPPERS: &[&str] = &["conda", "mamba", "micromamba", "uv", "poetry", "pipenv", "pdm", "rye"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    /// `&&`, `||`, `;`, `|`, `&`
    Control(&'static str),
    /// `>`, `>>`, `<`, `&>`: followed by a target word
    Redirect,
    /// `>&N`: no target
    Duplicate,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut chars = input.chars().peekable();

    fn flush(tokens: &mut Vec<Token>, word: &mut String, in_word: &mut bool) {
        if *in_word {
            tokens.push(Token::Word(std::mem::take(word)));
            *in_word = false;
        }
    }

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => word.push(ch),
                        None => return Err(LifecycleError::InvalidCommand("unterminated single quote".into())),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(ch @ ('"' | '\\' | '$' | '`')) => word.push(ch),
                            Some(ch) => {
                                word.push('\\');
                                word.push(ch);
                            }
                            None => break,
                        },
                        Some(ch) => word.push(ch),
                        None => return Err(LifecycleError::InvalidCommand("unterminated double quote".into())),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    // line continuation
                    Some('\n') => {}
                    Some(ch) => word.push(ch),
                    None => {}
                }
            }
            c if c.is_whitespace() => flush(&mut tokens, &mut word, &mut in_word),
            '&' => {
                flush(&mut tokens, &mut word, &mut in_word);
                match chars.peek() {
                    Some('&') => {
                        chars.next();
                        tokens.push(Token::Control("&&"));
                    }
                    Some('>') => {
                        chars.next();
                        if chars.peek() == Some(&'>') {
                            chars.next();
                        }
                        tokens.push(Token::Redirect);
                    }
                    _ => tokens.push(Token::Control("&")),
                }
            }
            '|' => {
                flush(&mut tokens, &mut word, &mut in_word);
                if chars.peek() == Some(&'|') {
                    chars.next();
                    tokens.push(Token::Control("||"));
                } else {
                    if chars.peek() == Some(&'&') {
                        chars.next();
                    }
                    tokens.push(Token::Control("|"));
                }
            }
            ';' => {
                flush(&mut tokens, &mut word, &mut in_word);
                tokens.push(Token::Control(";"));
            }
            '>' | '<' => {
                // a bare fd number before the operator belongs to it
                if in_word && !word.is_empty() && word.chars().all(|ch| ch.is_ascii_digit()) {
                    word.clear();
                    in_word = false;
                }
                flush(&mut tokens, &mut word, &mut in_word);
                if c == '>' && chars.peek() == Some(&'>') {
                    chars.next();
                }
                if c == '>' && chars.peek() == Some(&'&') {
                    chars.next();
                    while chars.peek().is_some_and(|ch| ch.is_ascii_digit() || *ch == '-') {
                        chars.next();
                    }
                    tokens.push(Token::Duplicate);
                } else {
                    tokens.push(Token::Redirect);
                }
            }
            _ => {
                in_word = true;
                word.push(c);
            }
        }
    }
    flush(&mut tokens, &mut word, &mut in_word);
    Ok(tokens)
}

/// Split into `&&`/`||`/`;` segments, keeping only the first element of each
/// pipeline and dropping redirections and backgrounding.
fn segments(tokens: Vec<Token>) -> Vec<Vec<String>> {
    let mut segments = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut in_pipe_tail = false;
    let mut skip_target = false;

    for token in tokens {
        match token {
            Token::Word(word) => {
                if skip_target {
                    skip_target = false;
                } else if !in_pipe_tail {
                    current.push(word);
                }
            }
            Token::Redirect => skip_target = true,
            Token::Duplicate => {}
            Token::Control("|") => in_pipe_tail = true,
            Token::Control("&") => {}
            Token::Control(_) => {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
                in_pipe_tail = false;
            }
        }
    }
    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

fn is_assignment(word: &str) -> bool {
    match word.split_once('=') {
        Some((name, _)) => {
            !name.is_empty()
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                && !name.starts_with(|c: char| c.is_ascii_digit())
        }
        None => false,
    }
}

fn split_assignment(word: &str) -> (String, String) {
    let (name, value) = word.split_once('=').unwrap_or((word, ""));
    (name.to_string(), value.to_string())
}

fn basename(word: &str) -> &str {
    word.rsplit('/').next().unwrap_or(word)
}

fn is_python(program: &str) -> bool {
    program == "python"
        || program
            .strip_prefix("python")
            .is_some_and(|rest| rest.chars().all(|c| c.is_ascii_digit() || c == '.'))
}

/// Quote a word for display if the shell would split it
fn display_word(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,@%+".contains(c))
    {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

fn flag_value(words: &[String], flags: &[&str], skip: Option<usize>) -> Option<String> {
    for (i, word) in words.iter().enumerate() {
        if Some(i) == skip {
            continue;
        }
        for flag in flags {
            if word == flag {
                if let Some(value) = words.get(i + 1).filter(|v| !v.starts_with('-')) {
                    return Some(value.clone());
                }
            } else if let Some(value) = word.strip_prefix(flag).and_then(|rest| rest.strip_prefix('=')) {
                if flag.starts_with("--") && !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

/// What identifies the launched process in a process listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSignature {
    /// Basename of the executable (`python3`, `vllm`, ...)
    pub program: String,
    /// Script basename or module for interpreters, else the program
    pub entry: String,
    pub port: Option<u16>,
    /// Whether the port appears on the command line itself
    pub port_in_args: bool,
}

/// A start command with its wrapper syntax removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub original: String,
    /// The server invocation alone
    pub clean: String,
    pub words: Vec<String>,
    /// Exported and inline variable assignments, in order
    pub env: Vec<(String, String)>,
    pub working_dir: Option<String>,
    /// Environment named by `conda activate` / `conda run -n`
    pub conda_env: Option<String>,
    /// Virtualenv directory named by `source <dir>/bin/activate`
    pub venv: Option<String>,
    pub port: Option<u16>,
    pub visible_devices: Option<(String, String)>,
    pub model_path: Option<String>,
    pub framework: Option<String>,
    pub signature: CommandSignature,
}

impl ParsedCommand {
    pub fn parse(command: &str) -> Result<Self> {
        let mut env = Vec::new();
        let mut working_dir = None;
        let mut conda_env = None;
        let mut venv = None;
        let mut launch: Option<Vec<String>> = None;

        for segment in segments(tokenize(command)?) {
            let first = segment[0].as_str();
            match first {
                "export" => env.extend(segment[1..].iter().filter(|w| is_assignment(w)).map(|w| split_assignment(w))),
                "cd" => working_dir = segment.get(1).cloned(),
                "source" | "." => {
                    if let Some(target) = segment.get(1) {
                        if let Some(dir) = target.strip_suffix("/bin/activate") {
                            venv = Some(dir.to_string());
                        } else if basename(target) == "activate" {
                            conda_env = segment.get(2).cloned();
                        }
                    }
                }
                "conda" | "mamba" | "micromamba" if segment.get(1).map(String::as_str) == Some("activate") => {
                    conda_env = segment.get(2).cloned();
                }
                "set" | "ulimit" | "umask" | "true" | "sleep" | "echo" | "unset" => {}
                _ if segment.iter().all(|w| is_assignment(w)) => env.extend(segment.iter().map(|w| split_assignment(w))),
                _ => launch = Some(segment),
            }
        }

        let Some(launch) = launch else {
            return Err(LifecycleError::InvalidCommand(format!(
                "no executable command found in '{}'",
                command.trim()
            )));
        };

        let words = strip_prefixes(launch, &mut env, &mut conda_env, &mut working_dir);
        if words.is_empty() {
            return Err(LifecycleError::InvalidCommand(format!(
                "no executable command found in '{}'",
                command.trim()
            )));
        }

        let program = basename(&words[0]).to_string();
        let mut module_flag = None;
        let entry = if is_python(&program) {
            let mut entry = program.clone();
            let mut i = 1;
            while i < words.len() {
                let word = &words[i];
                if word == "-m" {
                    module_flag = Some(i);
                    if let Some(module) = words.get(i + 1) {
                        entry = module.clone();
                    }
                    break;
                } else if word == "-X" || word == "-W" {
                    i += 2;
                    continue;
                } else if !word.starts_with('-') {
                    entry = basename(word).to_string();
                    break;
                }
                i += 1;
            }
            entry
        } else {
            program.clone()
        };

        let arg_port = flag_value(&words, PORT_FLAGS, None).and_then(|p| p.parse::<u16>().ok());
        let env_port = env.iter().rev().find_map(|(name, value)| {
            if name == "PORT" || name.ends_with("_PORT") {
                value.parse::<u16>().ok()
            } else if name.ends_with("_HOST") {
                value.rsplit_once(':').and_then(|(_, p)| p.parse::<u16>().ok())
            } else {
                None
            }
        });
        let port = arg_port.or(env_port);

        let model_path = flag_value(&words, MODEL_FLAGS, module_flag)
            .or_else(|| {
                // `vllm serve <model>` style positional
                let serve = words.iter().position(|w| w == "serve")?;
                words.get(serve + 1).filter(|w| !w.starts_with('-')).cloned()
            });

        let visible_devices = VISIBILITY_VARS.iter().find_map(|var| {
            env.iter()
                .rev()
                .find(|(name, _)| name == var)
                .map(|(name, value)| (name.clone(), value.clone()))
        });

        let clean = words.iter().map(|w| display_word(w)).collect::<Vec<_>>().join(" ");
        let lowered = clean.to_lowercase();
        let framework = FRAMEWORKS
            .iter()
            .find(|keyword| lowered.contains(*keyword))
            .map(|keyword| keyword.to_string());

        Ok(Self {
            original: command.to_string(),
            signature: CommandSignature {
                program,
                entry,
                port,
                port_in_args: arg_port.is_some(),
            },
            clean,
            words,
            env,
            working_dir,
            conda_env,
            venv,
            port,
            visible_devices,
            model_path,
            framework,
        })
    }

    /// Keyword used for pattern matching: the framework when known, else
    /// the entry point without its extension
    pub fn keyword(&self) -> &str {
        match &self.framework {
            Some(framework) => framework,
            None => self
                .signature
                .entry
                .strip_suffix(".py")
                .unwrap_or(&self.signature.entry),
        }
    }
}

/// Remove launcher prefixes (`nohup`, `env`, `VAR=x`, `conda run -n env`,
/// `uv run`, ...) from the front of the launch segment.
fn strip_prefixes(
    words: Vec<String>,
    env: &mut Vec<(String, String)>,
    conda_env: &mut Option<String>,
    working_dir: &mut Option<String>,
) -> Vec<String> {
    let mut i = 0;
    while i < words.len() {
        let word = words[i].as_str();
        match word {
            "nohup" | "setsid" | "exec" | "time" | "command" => i += 1,
            "nice" => {
                i += 1;
                if words.get(i).map(String::as_str) == Some("-n") {
                    i += 2;
                } else if words.get(i).is_some_and(|w| w.starts_with('-')) {
                    i += 1;
                }
            }
            "stdbuf" | "sudo" => {
                i += 1;
                while words.get(i).is_some_and(|w| w.starts_with('-')) {
                    i += 1;
                }
            }
            "env" => {
                i += 1;
                while let Some(next) = words.get(i) {
                    if next == "-u" {
                        i += 2;
                    } else if next.starts_with('-') {
                        i += 1;
                    } else if is_assignment(next) {
                        env.push(split_assignment(next));
                        i += 1;
                    } else {
                        break;
                    }
                }
            }
            w if is_assignment(w) => {
                env.push(split_assignment(w));
                i += 1;
            }
            w if RUN_WRAPPERS.contains(&w) && words.get(i + 1).map(String::as_str) == Some("run") => {
                i += 2;
                while let Some(next) = words.get(i) {
                    match next.as_str() {
                        "-n" | "--name" | "-p" | "--prefix" => {
                            *conda_env = words.get(i + 1).cloned();
                            i += 2;
                        }
                        "--cwd" => {
                            *working_dir = words.get(i + 1).cloned();
                            i += 2;
                        }
                        "--with" | "--python" | "--env-file" => i += 2,
                        flag if flag.starts_with("--name=") || flag.starts_with("--prefix=") => {
                            *conda_env = flag.split_once('=').map(|(_, v)| v.to_string());
                            i += 1;
                        }
                        flag if flag.starts_with('-') => i += 1,
                        _ => break,
                    }
                }
            }
            _ => break,
        }
    }
    words.into_iter().skip(i).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_python_command() {
        let parsed = ParsedCommand::parse("python server.py --port 9000").unwrap();

        assert_eq!(parsed.clean, "python server.py --port 9000");
        assert_eq!(parsed.port, Some(9000));
        assert_eq!(parsed.signature.program, "python");
        assert_eq!(parsed.signature.entry, "server.py");
        assert!(parsed.signature.port_in_args);
        assert_eq!(parsed.framework, None);
        assert_eq!(parsed.keyword(), "server");
    }

    #[test]
    fn test_wrapper_syntax_is_stripped() {
        let parsed = ParsedCommand::parse(
            "export CUDA_VISIBLE_DEVICES=0,1 && cd /srv/app && nohup python3 -m vllm.entrypoints.openai.api_server \
             --model /models/llama-3-8b --port=8000 > /tmp/vllm.log 2>&1 &",
        )
        .unwrap();

        assert_eq!(
            parsed.clean,
            "python3 -m vllm.entrypoints.openai.api_server --model /models/llama-3-8b --port=8000"
        );
        assert_eq!(parsed.working_dir.as_deref(), Some("/srv/app"));
        assert_eq!(parsed.port, Some(8000));
        assert_eq!(parsed.model_path.as_deref(), Some("/models/llama-3-8b"));
        assert_eq!(parsed.signature.entry, "vllm.entrypoints.openai.api_server");
        assert_eq!(parsed.framework.as_deref(), Some("vllm"));
        assert_eq!(
            parsed.visible_devices,
            Some(("CUDA_VISIBLE_DEVICES".to_string(), "0,1".to_string()))
        );
    }

    #[test]
    fn test_conda_run_and_inline_env() {
        let parsed = ParsedCommand::parse(
            "HIP_VISIBLE_DEVICES=2 conda run --no-capture-output -n serving python app/main.py -p 7860 | tee out.log",
        )
        .unwrap();

        assert_eq!(parsed.clean, "python app/main.py -p 7860");
        assert_eq!(parsed.conda_env.as_deref(), Some("serving"));
        assert_eq!(parsed.port, Some(7860));
        assert_eq!(parsed.signature.entry, "main.py");
        assert_eq!(parsed.visible_devices.map(|(k, _)| k), Some("HIP_VISIBLE_DEVICES".to_string()));
    }

    #[test]
    fn test_activation_segments() {
        let parsed =
            ParsedCommand::parse("source /opt/venvs/tgi/bin/activate; text-generation-launcher --model-id bigcode/starcoder")
                .unwrap();
        assert_eq!(parsed.venv.as_deref(), Some("/opt/venvs/tgi"));
        assert_eq!(parsed.framework.as_deref(), Some("text-generation-launcher"));
        assert_eq!(parsed.model_path.as_deref(), Some("bigcode/starcoder"));
        assert_eq!(parsed.port, None);

        let parsed = ParsedCommand::parse("conda activate llm && python serve.py").unwrap();
        assert_eq!(parsed.conda_env.as_deref(), Some("llm"));
    }

    #[test]
    fn test_port_from_environment() {
        let parsed = ParsedCommand::parse("OLLAMA_HOST=0.0.0.0:11500 ollama serve").unwrap();
        assert_eq!(parsed.port, Some(11500));
        assert!(!parsed.signature.port_in_args);
        assert_eq!(parsed.framework.as_deref(), Some("ollama"));
        // `serve` with no positional model
        assert_eq!(parsed.model_path, None);
    }

    #[test]
    fn test_positional_model_and_quotes() {
        let parsed =
            ParsedCommand::parse(r#"vllm serve "/data/my models/qwen" --served-model-name 'qwen 7b'"#).unwrap();
        assert_eq!(parsed.model_path.as_deref(), Some("/data/my models/qwen"));
        assert_eq!(parsed.clean, "vllm serve '/data/my models/qwen' --served-model-name 'qwen 7b'");
    }

    #[test]
    fn test_llama_server_model_flag() {
        let parsed = ParsedCommand::parse("./llama-server -m /models/q4.gguf --port 8081").unwrap();
        assert_eq!(parsed.signature.program, "llama-server");
        assert_eq!(parsed.model_path.as_deref(), Some("/models/q4.gguf"));
        assert_eq!(parsed.port, Some(8081));
    }

    #[test]
    fn test_invalid_commands() {
        assert!(ParsedCommand::parse("").is_err());
        assert!(ParsedCommand::parse("export A=1 && cd /tmp").is_err());
        assert!(ParsedCommand::parse("python 'unterminated").is_err());
    }

    #[test]
    fn test_python_version_detection() {
        assert!(is_python("python3.11"));
        assert!(is_python("python"));
        assert!(!is_python("pythonista"));
    }
}
