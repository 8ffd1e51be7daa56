//! Line-oriented terminal client: parses commands from stdin and prints
//! controller notifications.

use nearchat_core::{ChatEvents, ChatMessage, Peer, UiEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::debug;

pub const HELP: &str = "\
/discover [id]     start discovery, advertising a 9-digit student id
/stop              stop discovery
/peers             list discovered peers
/connect <n|addr>  connect to peer number n or device address
/disconnect        close the current session
/quit              exit
anything else is sent as a chat message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {
    Discover(Option<String>),
    StopDiscovery,
    ListPeers,
    Connect(String),
    Disconnect,
    Send(String),
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseCommandError {
    #[error("unknown command {0}; try /help")]
    Unknown(String),
    #[error("{0} needs an argument")]
    MissingArgument(&'static str),
}

/// `Ok(None)` for blank input and `/help`.
pub fn parse_command(line: &str) -> Result<Option<UserCommand>, ParseCommandError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    if !line.starts_with('/') {
        return Ok(Some(UserCommand::Send(line.to_string())));
    }
    let (cmd, arg) = match line.split_once(char::is_whitespace) {
        Some((cmd, arg)) => (cmd, Some(arg.trim()).filter(|a| !a.is_empty())),
        None => (line, None),
    };
    let command = match cmd {
        "/discover" => UserCommand::Discover(arg.map(str::to_string)),
        "/stop" => UserCommand::StopDiscovery,
        "/peers" => UserCommand::ListPeers,
        "/connect" => UserCommand::Connect(
            arg.ok_or(ParseCommandError::MissingArgument("/connect"))?
                .to_string(),
        ),
        "/disconnect" => UserCommand::Disconnect,
        "/quit" | "/exit" => UserCommand::Quit,
        "/help" => return Ok(None),
        other => return Err(ParseCommandError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}

/// Read stdin until end of input or `/quit`. End of input counts as `/quit`.
pub async fn read_commands(commands: mpsc::UnboundedSender<UserCommand>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "stdin closed");
                break;
            }
        };
        match parse_command(&line) {
            Ok(Some(cmd)) => {
                let quit = cmd == UserCommand::Quit;
                if commands.send(cmd).is_err() || quit {
                    return;
                }
            }
            Ok(None) if line.trim() == "/help" => println!("{HELP}"),
            Ok(None) => {}
            Err(e) => println!("! {e}"),
        }
    }
    let _ = commands.send(UserCommand::Quit);
}

/// Prints every notification to stdout.
#[derive(Debug, Default)]
pub struct Console;

pub fn format_peers(peers: &[Peer]) -> String {
    if peers.is_empty() {
        return "no peers".to_string();
    }
    peers
        .iter()
        .enumerate()
        .map(|(i, p)| format!("{:>3}. {} ({})", i + 1, p.name, p.address))
        .collect::<Vec<_>>()
        .join("\n")
}

impl ChatEvents for Console {
    fn on_adapter_state_changed(&self, enabled: bool) {
        println!("* adapter {}", if enabled { "enabled" } else { "disabled" });
    }

    fn on_peer_list_updated(&self, peers: &[Peer]) {
        println!("* peers:\n{}", format_peers(peers));
    }

    fn on_device_status_changed(&self, device: &Peer) {
        println!("* this device: {} ({})", device.name, device.address);
    }

    fn on_message_received(&self, message: &ChatMessage) {
        println!("[{}] {}", message.sender_ip, message.message);
    }

    fn on_notification(&self, event: &UiEvent) {
        match event {
            UiEvent::MessageSent(m) => println!("[me] {}", m.message),
            UiEvent::StateChanged(state) => println!("* state: {state:?}"),
            UiEvent::Connected { remote } => println!("* connected to {remote}"),
            UiEvent::Authenticated { peer_identifier } => match peer_identifier {
                Some(id) => println!("* authenticated peer {id}"),
                None => println!("* authenticated"),
            },
            UiEvent::Disconnected { reason } => println!("* disconnected: {reason}"),
            UiEvent::Error(e) => println!("! {e}"),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nearchat_core::DeviceAddress;

    #[test]
    fn commands_parse() {
        assert_eq!(parse_command("/discover").unwrap(), Some(UserCommand::Discover(None)));
        assert_eq!(
            parse_command("  /discover 816012345 ").unwrap(),
            Some(UserCommand::Discover(Some("816012345".into())))
        );
        assert_eq!(parse_command("/stop").unwrap(), Some(UserCommand::StopDiscovery));
        assert_eq!(parse_command("/peers").unwrap(), Some(UserCommand::ListPeers));
        assert_eq!(
            parse_command("/connect 2").unwrap(),
            Some(UserCommand::Connect("2".into()))
        );
        assert_eq!(parse_command("/disconnect").unwrap(), Some(UserCommand::Disconnect));
        assert_eq!(parse_command("/exit").unwrap(), Some(UserCommand::Quit));
    }

    #[test]
    fn plain_text_is_a_message() {
        assert_eq!(
            parse_command("hello there").unwrap(),
            Some(UserCommand::Send("hello there".into()))
        );
        assert_eq!(parse_command("   ").unwrap(), None);
        assert_eq!(parse_command("/help").unwrap(), None);
    }

    #[test]
    fn bad_commands_rejected() {
        assert_eq!(
            parse_command("/connect").unwrap_err(),
            ParseCommandError::MissingArgument("/connect")
        );
        assert_eq!(
            parse_command("/dance now").unwrap_err(),
            ParseCommandError::Unknown("/dance".into())
        );
    }

    #[test]
    fn peers_are_numbered_from_one() {
        let peers = vec![
            Peer::seen(DeviceAddress::from_bytes([2, 0, 0, 0, 0, 1]), "816000001"),
            Peer::seen(DeviceAddress::from_bytes([2, 0, 0, 0, 0, 2]), "816000002"),
        ];
        let text = format_peers(&peers);
        assert!(text.contains("  1. 816000001 (02:00:00:00:00:01)"));
        assert!(text.contains("  2. 816000002"));
        assert_eq!(format_peers(&[]), "no peers");
    }
}
