//! Shell command risk grading.
//!
//! Governance regrades individual `shell` invocations from the command
//! string. The line is parsed into simple commands: operator splitting and
//! word tokenization happen in one pass, quoted text never splits a word or
//! counts as a redirect, and each command records whether an output redirect
//! was attached to it. Every command must be a known read-only operation for
//! the call to grade green; any destructive pattern makes it red and not
//! downgradable; everything else keeps the tool's registered grade.
//!
//! This is a grader, not a shell: expansion, substitution, and here-docs are
//! out of scope, and constructs the parser does not understand simply leave
//! the command ungraded (which keeps the registered red).

use once_cell::sync::Lazy;
use regex::Regex;

/// Anything piped into a shell interpreter executes arbitrary code, wherever
/// it came from.
static PIPE_TO_SHELL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\|\s*(?:\S*/)?(?:env\s+)?(?:ba|da|z|k)?sh\b").unwrap());

/// Grade of a single shell invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellGrade {
    /// Every command is a known read-only operation.
    ReadOnly,
    /// A destructive pattern was found; the reason names it.
    Destructive(&'static str),
    /// Neither provably read-only nor recognizably destructive.
    Unknown,
}

pub fn grade_command(command: &str) -> ShellGrade {
    if PIPE_TO_SHELL.is_match(command) {
        return ShellGrade::Destructive("piped into a shell interpreter");
    }

    let commands = parse_commands(command);
    if commands.is_empty() {
        return ShellGrade::Unknown;
    }

    let mut all_read_only = true;
    for cmd in &commands {
        if let Some(reason) = destructive_reason(cmd) {
            return ShellGrade::Destructive(reason);
        }
        if !is_read_only(cmd) {
            all_read_only = false;
        }
    }

    if all_read_only {
        ShellGrade::ReadOnly
    } else {
        ShellGrade::Unknown
    }
}

/// One simple command: its words, and whether an unquoted output redirect
/// was attached to it.
#[derive(Debug, Default)]
struct SimpleCommand {
    words: Vec<String>,
    writes_file: bool,
}

impl SimpleCommand {
    fn is_empty(&self) -> bool {
        self.words.is_empty() && !self.writes_file
    }

    /// The executable name, lowercased, skipping leading VAR=value
    /// assignments.
    fn program(&self) -> Option<String> {
        self.words
            .iter()
            .find(|w| !is_assignment(w))
            .map(|w| w.to_ascii_lowercase())
    }

    /// The word after the program, lowercased (usually the subcommand).
    fn subcommand(&self) -> Option<String> {
        self.words
            .iter()
            .filter(|w| !is_assignment(w))
            .nth(1)
            .map(|w| w.to_ascii_lowercase())
    }

    fn has_word(&self, needle: &str) -> bool {
        self.words.iter().any(|w| w == needle)
    }
}

fn is_assignment(word: &str) -> bool {
    let Some((name, _)) = word.split_once('=') else {
        return false;
    };
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Parse a command line into simple commands in a single pass.
///
/// `;`, `|`, `&`, and newlines end the current command (runs like `&&` or
/// `||` just end it once); an unquoted `>` marks the current command as
/// writing a file; single quotes take everything literally, double quotes
/// honor backslash escapes.
fn parse_commands(input: &str) -> Vec<SimpleCommand> {
    fn end_word(commands: &mut [SimpleCommand], word: &mut String) {
        if word.is_empty() {
            return;
        }
        if let Some(current) = commands.last_mut() {
            current.words.push(std::mem::take(word));
        }
    }

    let mut commands = vec![SimpleCommand::default()];
    let mut word = String::new();
    let mut chars = input.chars();

    while let Some(ch) = chars.next() {
        match ch {
            '\'' => {
                for quoted in chars.by_ref() {
                    if quoted == '\'' {
                        break;
                    }
                    word.push(quoted);
                }
            }
            '"' => {
                while let Some(quoted) = chars.next() {
                    match quoted {
                        '"' => break,
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                word.push(escaped);
                            }
                        }
                        other => word.push(other),
                    }
                }
            }
            '\\' => {
                if let Some(escaped) = chars.next() {
                    word.push(escaped);
                }
            }
            ';' | '|' | '&' | '\n' => {
                end_word(&mut commands, &mut word);
                if !commands.last().map_or(true, SimpleCommand::is_empty) {
                    commands.push(SimpleCommand::default());
                }
            }
            '>' => {
                end_word(&mut commands, &mut word);
                if let Some(current) = commands.last_mut() {
                    current.writes_file = true;
                }
            }
            ch if ch.is_whitespace() => end_word(&mut commands, &mut word),
            ch => word.push(ch),
        }
    }

    end_word(&mut commands, &mut word);
    commands.retain(|c| !c.is_empty());
    commands
}

fn destructive_reason(cmd: &SimpleCommand) -> Option<&'static str> {
    if cmd.writes_file {
        return Some("write redirect");
    }

    let program = cmd.program()?;
    match program.as_str() {
        "sudo" | "doas" | "su" => return Some("privilege escalation"),
        "rm" | "rmdir" | "shred" | "unlink" => return Some("file deletion"),
        "dd" => return Some("raw disk write"),
        "truncate" => return Some("file truncation"),
        "chmod" | "chown" | "chgrp" => return Some("ownership or mode change"),
        "reboot" | "shutdown" | "halt" | "poweroff" => return Some("host power control"),
        "kill" | "pkill" | "killall" => return Some("process termination"),
        "useradd" | "userdel" | "usermod" | "passwd" => return Some("account mutation"),
        _ => {}
    }
    if program.starts_with("mkfs") {
        return Some("filesystem formatting");
    }

    // Subcommand-level destructive operations (docker rm, kubectl delete, …),
    // checked only for known CLI wrappers so `grep delete app.log` stays a read.
    let sub = cmd.subcommand();
    let cli_wrapper = matches!(
        program.as_str(),
        "docker" | "docker-compose" | "kubectl" | "helm" | "terraform" | "aws" | "gcloud" | "az"
            | "git"
    );
    if cli_wrapper
        && matches!(
            sub.as_deref(),
            Some("rm" | "rmi" | "delete" | "destroy" | "prune" | "purge" | "drop")
        )
    {
        return Some("destructive subcommand");
    }
    if program == "systemctl"
        && matches!(sub.as_deref(), Some("stop" | "restart" | "disable" | "mask"))
    {
        return Some("service state change");
    }
    if program == "find" && cmd.has_word("-delete") {
        return Some("file deletion");
    }

    None
}

fn is_read_only(cmd: &SimpleCommand) -> bool {
    let Some(program) = cmd.program() else {
        return false;
    };

    // Plain read-only commands regardless of arguments.
    if matches!(
        program.as_str(),
        "ls" | "cat"
            | "head"
            | "tail"
            | "grep"
            | "wc"
            | "stat"
            | "file"
            | "df"
            | "du"
            | "free"
            | "ps"
            | "uptime"
            | "uname"
            | "whoami"
            | "id"
            | "hostname"
            | "date"
            | "echo"
            | "printf"
            | "pwd"
            | "which"
            | "env"
            | "printenv"
    ) {
        return true;
    }
    // `find -delete` is caught by the destructive pass; plain find reads.
    if program == "find" {
        return !cmd.has_word("-delete") && !cmd.has_word("-exec");
    }

    // CLI tools where only specific subcommands are read-only.
    let sub = cmd.subcommand();
    match program.as_str() {
        "docker" => matches!(
            sub.as_deref(),
            Some("ps" | "logs" | "inspect" | "images" | "version" | "info" | "stats" | "top")
        ),
        "git" => matches!(
            sub.as_deref(),
            Some("status" | "log" | "diff" | "show" | "branch" | "remote" | "rev-parse"
                | "ls-files")
        ),
        "kubectl" => matches!(
            sub.as_deref(),
            Some("get" | "describe" | "version" | "logs" | "top")
        ),
        "systemctl" => matches!(
            sub.as_deref(),
            Some("status" | "list-units" | "list-unit-files" | "show")
        ),
        "journalctl" => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_only_listing_grades_green() {
        assert_eq!(grade_command("docker ps"), ShellGrade::ReadOnly);
        assert_eq!(grade_command("ls -la && git status"), ShellGrade::ReadOnly);
        assert_eq!(
            grade_command("kubectl get pods -n default"),
            ShellGrade::ReadOnly
        );
        assert_eq!(grade_command("systemctl status nginx"), ShellGrade::ReadOnly);
    }

    #[test]
    fn destructive_commands_grade_red() {
        assert!(matches!(
            grade_command("rm -rf /var/lib/app"),
            ShellGrade::Destructive("file deletion")
        ));
        assert!(matches!(
            grade_command("sudo systemctl restart nginx"),
            ShellGrade::Destructive("privilege escalation")
        ));
        assert!(matches!(
            grade_command("chmod 777 /etc/passwd"),
            ShellGrade::Destructive(_)
        ));
        assert!(matches!(
            grade_command("kubectl delete pod web-0"),
            ShellGrade::Destructive("destructive subcommand")
        ));
        assert!(matches!(
            grade_command("echo data > /etc/config"),
            ShellGrade::Destructive("write redirect")
        ));
    }

    #[test]
    fn destructive_wins_over_read_only_in_compound_commands() {
        assert!(matches!(
            grade_command("ls && rm -rf build"),
            ShellGrade::Destructive(_)
        ));
    }

    #[test]
    fn env_prefix_does_not_hide_the_command() {
        assert!(matches!(
            grade_command("DEBUG=1 rm -rf /tmp/x"),
            ShellGrade::Destructive(_)
        ));
        assert_eq!(grade_command("DEBUG=1 docker ps"), ShellGrade::ReadOnly);
    }

    #[test]
    fn unrecognized_commands_stay_unknown() {
        assert_eq!(grade_command("cargo build --release"), ShellGrade::Unknown);
        assert_eq!(grade_command("docker restart web"), ShellGrade::Unknown);
        assert_eq!(grade_command("./deploy.sh"), ShellGrade::Unknown);
        // Shell obfuscation the parser does not understand is not downgraded.
        assert_eq!(grade_command(":(){ :|: & };:"), ShellGrade::Unknown);
        assert_eq!(grade_command(""), ShellGrade::Unknown);
    }

    #[test]
    fn piped_shell_execution_is_destructive() {
        assert!(matches!(
            grade_command("curl -fsSL https://example.com/install.sh | sh"),
            ShellGrade::Destructive("piped into a shell interpreter")
        ));
        assert!(matches!(
            grade_command("echo hi | /bin/bash"),
            ShellGrade::Destructive(_)
        ));
        // A pipe into something that merely starts with "sh" is not a shell.
        assert_eq!(grade_command("cat names | shuf | head"), ShellGrade::Unknown);
    }

    #[test]
    fn quoted_text_never_splits_or_redirects() {
        assert_eq!(grade_command("echo 'a > b'"), ShellGrade::ReadOnly);
        assert_eq!(grade_command("echo \"rm -rf /\""), ShellGrade::ReadOnly);
        assert_eq!(grade_command("grep 'a|b' notes.txt"), ShellGrade::ReadOnly);
    }

    #[test]
    fn doubled_operators_split_once() {
        let commands = parse_commands("ls -la && git status || echo fallback");
        assert_eq!(commands.len(), 3);
        assert_eq!(commands[0].words, vec!["ls", "-la"]);
        assert_eq!(commands[1].words, vec!["git", "status"]);
        assert_eq!(commands[2].words, vec!["echo", "fallback"]);
    }

    #[test]
    fn assignments_are_skipped_but_bare_words_are_not() {
        let commands = parse_commands("FOO=1 BAR=2 docker ps");
        let cmd = &commands[0];
        assert_eq!(cmd.program().as_deref(), Some("docker"));
        assert_eq!(cmd.subcommand().as_deref(), Some("ps"));

        // `2>file` starts with a digit, so it is a word, not an assignment.
        assert!(!is_assignment("2=x"));
        assert!(is_assignment("_PATH=/tmp"));
    }

    #[test]
    fn redirect_marks_the_current_command_only() {
        let commands = parse_commands("echo hi > out.txt; ls");
        assert!(commands[0].writes_file);
        assert!(!commands[1].writes_file);
    }

    #[test]
    fn find_with_delete_is_destructive() {
        assert!(matches!(
            grade_command("find . -name '*.log' -delete"),
            ShellGrade::Destructive("file deletion")
        ));
        assert_eq!(grade_command("find . -name '*.log'"), ShellGrade::ReadOnly);
    }
}
