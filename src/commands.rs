//! Line-oriented console commands for the front end.

use crate::engine::events::{EngineCommand, EngineEvent};

pub const HELP: &str = "\
commands:
  vol <0..1>      set volume (unmutes)
  up | down       step volume
  mute | unmute   set mute
  toggle          toggle mute
  output <uid>    route to another output device
  list            show eligible outputs
  wake            re-route as after system wake
  quit            restore defaults and exit";

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleInput {
    Engine(EngineEvent),
    List,
    Help,
}

impl ConsoleInput {
    /// The console stops reading once it has asked the engine to quit
    pub fn is_quit(&self) -> bool {
        matches!(
            self,
            ConsoleInput::Engine(EngineEvent::Command(EngineCommand::Quit))
        )
    }
}

/// Parse one console line. Blank lines yield `Ok(None)`.
pub fn parse_line(line: &str) -> Result<Option<ConsoleInput>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let argument = words.next();
    let command = |c| Ok(Some(ConsoleInput::Engine(EngineEvent::Command(c))));

    match verb.to_ascii_lowercase().as_str() {
        "vol" | "volume" => {
            let value = argument.ok_or("usage: vol <0..1>")?;
            let volume: f32 = value
                .parse()
                .map_err(|_| format!("not a number: '{}'", value))?;
            command(EngineCommand::SetVolume(volume))
        }
        "up" | "+" => command(EngineCommand::StepVolume { up: true }),
        "down" | "-" => command(EngineCommand::StepVolume { up: false }),
        "mute" => command(EngineCommand::SetMuted(true)),
        "unmute" => command(EngineCommand::SetMuted(false)),
        "toggle" => command(EngineCommand::ToggleMute),
        "output" => {
            let uid = argument.ok_or("usage: output <uid>")?;
            command(EngineCommand::SelectOutput(uid.to_string()))
        }
        "list" | "ls" => Ok(Some(ConsoleInput::List)),
        "wake" => Ok(Some(ConsoleInput::Engine(EngineEvent::Wake))),
        "help" | "?" => Ok(Some(ConsoleInput::Help)),
        "quit" | "exit" | "q" => command(EngineCommand::Quit),
        other => Err(format!("unknown command '{}' (try 'help')", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_command(line: &str) -> EngineCommand {
        match parse_line(line) {
            Ok(Some(ConsoleInput::Engine(EngineEvent::Command(c)))) => c,
            other => panic!("'{}' parsed as {:?}", line, other),
        }
    }

    #[test]
    fn test_parses_gain_commands() {
        assert_eq!(engine_command("vol 0.25"), EngineCommand::SetVolume(0.25));
        assert_eq!(engine_command("  UP "), EngineCommand::StepVolume { up: true });
        assert_eq!(engine_command("down"), EngineCommand::StepVolume { up: false });
        assert_eq!(engine_command("mute"), EngineCommand::SetMuted(true));
        assert_eq!(engine_command("toggle"), EngineCommand::ToggleMute);
    }

    #[test]
    fn test_parses_output_and_quit() {
        assert_eq!(
            engine_command("output AppleUSBAudioEngine:Dell:1"),
            EngineCommand::SelectOutput("AppleUSBAudioEngine:Dell:1".to_string())
        );
        assert_eq!(engine_command("quit"), EngineCommand::Quit);
    }

    #[test]
    fn test_only_quit_ends_the_console() {
        for line in ["quit", "exit", "q"] {
            assert!(parse_line(line).unwrap().unwrap().is_quit(), "{}", line);
        }
        for line in ["mute", "list", "wake", "output mon"] {
            assert!(!parse_line(line).unwrap().unwrap().is_quit(), "{}", line);
        }
    }

    #[test]
    fn test_blank_and_bad_input() {
        assert_eq!(parse_line("   "), Ok(None));
        assert!(parse_line("vol").is_err());
        assert!(parse_line("vol loud").is_err());
        assert!(parse_line("output").is_err());
        assert!(parse_line("dance").is_err());
        assert_eq!(parse_line("list"), Ok(Some(ConsoleInput::List)));
    }
}
