//! Stdin command parsing.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect(String),
    Disconnect(String),
    Join { server: String, channel: String },
    Msg { server: String, target: String, text: String },
    History { server: String, target: String },
    List,
    Help,
    Quit,
}

pub const HELP: &str = "\
Commands:
  /connect <server>              connect to a configured server
  /disconnect <server>           disconnect (no auto-reconnect)
  /join <server> <#channel>      join a channel
  /msg <server> <target> <text>  send a message
  /history <server> <target>     show recent logged messages
  /list                          show connections
  /quit                          disconnect everything and exit";

/// Parse one input line. Blank lines yield `Ok(None)`.
pub fn parse(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Err("commands start with '/', try /help".to_string());
    };
    let (name, args) = rest.split_once(' ').unwrap_or((rest, ""));
    let args = args.trim();

    let command = match name.to_ascii_lowercase().as_str() {
        "connect" => Command::Connect(one_arg(args, "/connect <server>")?),
        "disconnect" => Command::Disconnect(one_arg(args, "/disconnect <server>")?),
        "join" => {
            let mut parts = args.split_whitespace();
            match (parts.next(), parts.next(), parts.next()) {
                (Some(server), Some(channel), None) => Command::Join {
                    server: server.to_string(),
                    channel: channel.to_string(),
                },
                _ => return Err("usage: /join <server> <#channel>".to_string()),
            }
        }
        "msg" => {
            let mut parts = args.splitn(3, ' ');
            match (parts.next(), parts.next(), parts.next().map(str::trim)) {
                (Some(server), Some(target), Some(text)) if !text.is_empty() => Command::Msg {
                    server: server.to_string(),
                    target: target.to_string(),
                    text: text.to_string(),
                },
                _ => return Err("usage: /msg <server> <target> <text>".to_string()),
            }
        }
        "history" => {
            let mut parts = args.split_whitespace();
            match (parts.next(), parts.next(), parts.next()) {
                (Some(server), Some(target), None) => Command::History {
                    server: server.to_string(),
                    target: target.to_string(),
                },
                _ => return Err("usage: /history <server> <target>".to_string()),
            }
        }
        "list" => Command::List,
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(format!("unknown command /{other}, try /help")),
    };
    Ok(Some(command))
}

fn one_arg(args: &str, usage: &str) -> Result<String, String> {
    if args.is_empty() || args.contains(char::is_whitespace) {
        return Err(format!("usage: {usage}"));
    }
    Ok(args.to_string())
}
