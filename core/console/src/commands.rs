//! Operator commands typed into the `watch` session.

use callwatch_protocol::OperatorStatus;

pub const HELP: &str = "\
commands:
  calls                                   list active calls
  queue                                   list open escalations
  inspect <call>                          follow one call live
  close                                   stop following
  resolve <call> [--kb <category>] <answer>
                                          answer an escalation
  status <available|away|busy|offline> [message]
                                          change availability
  help                                    show this text
  quit                                    leave the session";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    Calls,
    Queue,
    Inspect(String),
    Close,
    Resolve {
        call_id: String,
        category: Option<String>,
        answer: String,
    },
    Status {
        status: OperatorStatus,
        message: Option<String>,
    },
    Help,
    Quit,
}

/// Parses one input line. Blank lines yield `Ok(None)`.
pub fn parse_command(line: &str) -> Result<Option<OperatorCommand>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (verb, rest) = split_word(line);

    let command = match verb.to_ascii_lowercase().as_str() {
        "calls" | "ls" => OperatorCommand::Calls,
        "queue" | "q" => OperatorCommand::Queue,
        "close" => OperatorCommand::Close,
        "help" | "?" => OperatorCommand::Help,
        "quit" | "exit" => OperatorCommand::Quit,
        "inspect" | "watch" => {
            let (call_id, extra) = split_word(rest);
            if call_id.is_empty() {
                return Err("usage: inspect <call>".to_string());
            }
            if !extra.is_empty() {
                return Err(format!("unexpected input after call id: {}", extra));
            }
            OperatorCommand::Inspect(call_id.to_string())
        }
        "resolve" | "answer" => parse_resolve(rest)?,
        "status" => {
            let (status, message) = split_word(rest);
            let status = status.parse::<OperatorStatus>().map_err(|_| {
                "usage: status <available|away|busy|offline> [message]".to_string()
            })?;
            OperatorCommand::Status {
                status,
                message: (!message.is_empty()).then(|| message.to_string()),
            }
        }
        other => return Err(format!("unknown command '{}', try help", other)),
    };
    Ok(Some(command))
}

fn parse_resolve(rest: &str) -> Result<OperatorCommand, String> {
    const USAGE: &str = "usage: resolve <call> [--kb <category>] <answer>";

    let (call_id, rest) = split_word(rest);
    if call_id.is_empty() {
        return Err(USAGE.to_string());
    }
    let (category, answer) = match split_word(rest) {
        ("--kb", after) => {
            let (category, answer) = split_word(after);
            if category.is_empty() {
                return Err(USAGE.to_string());
            }
            (Some(category.to_string()), answer)
        }
        _ => (None, rest),
    };
    if answer.is_empty() {
        return Err(USAGE.to_string());
    }
    Ok(OperatorCommand::Resolve {
        call_id: call_id.to_string(),
        category,
        answer: answer.to_string(),
    })
}

fn split_word(input: &str) -> (&str, &str) {
    let input = input.trim_start();
    match input.find(char::is_whitespace) {
        Some(idx) => (&input[..idx], input[idx..].trim()),
        None => (input, ""),
    }
}
