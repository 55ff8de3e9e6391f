use beach_call::EndpointId;
use beach_call::session::{CallNotice, CallSnapshot};

/// A line typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineCommand {
    Call(EndpointId),
    Accept,
    Reject,
    End,
    Mute(bool),
    Video(bool),
    SwitchCamera,
    Status,
    Help,
    Quit,
}

pub const HELP: &str = "commands: call <peer> | accept | reject | end | mute | unmute | video on|off | camera | status | quit";

impl LineCommand {
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };
        let arg = words.next();
        let command = match (verb.to_ascii_lowercase().as_str(), arg) {
            ("call", Some(peer)) => {
                LineCommand::Call(EndpointId::new(peer).map_err(|err| err.to_string())?)
            }
            ("call", None) => return Err("usage: call <peer>".into()),
            ("accept", _) => LineCommand::Accept,
            ("reject", _) => LineCommand::Reject,
            ("end" | "hangup", _) => LineCommand::End,
            ("mute", _) => LineCommand::Mute(true),
            ("unmute", _) => LineCommand::Mute(false),
            ("video", Some("on")) => LineCommand::Video(true),
            ("video", Some("off")) => LineCommand::Video(false),
            ("video", _) => return Err("usage: video on|off".into()),
            ("camera", _) => LineCommand::SwitchCamera,
            ("status", _) => LineCommand::Status,
            ("help" | "?", _) => LineCommand::Help,
            ("quit" | "exit", _) => LineCommand::Quit,
            (other, _) => return Err(format!("unknown command {other:?}; {HELP}")),
        };
        Ok(Some(command))
    }
}

pub fn describe_snapshot(snapshot: &CallSnapshot) -> String {
    let mut line = format!("[{}]", snapshot.phase);
    if let Some(peer) = &snapshot.peer {
        line.push_str(&format!(" peer={peer}"));
    }
    if snapshot.has_local_media {
        line.push_str(if snapshot.muted { " mic=off" } else { " mic=on" });
        line.push_str(if snapshot.video_enabled { " cam=on" } else { " cam=off" });
    }
    if snapshot.has_remote_media {
        line.push_str(" remote-media");
    }
    if snapshot.media_connected {
        line.push_str(" connected");
    }
    if let Some(fatal) = &snapshot.fatal {
        line.push_str(&format!(" fatal={fatal}"));
    }
    line
}

pub fn describe_notice(notice: &CallNotice) -> String {
    match notice {
        CallNotice::Incoming { peer } => format!("incoming call from {peer} (accept / reject)"),
        CallNotice::Accepted { peer } => format!("{peer} accepted"),
        CallNotice::Connected { peer } => format!("media connected with {peer}"),
        CallNotice::BusyRejected { peer } => format!("turned away {peer}: busy"),
        CallNotice::PermissionDenied { peer } => format!("permission denied for call with {peer}"),
        CallNotice::Ended { peer, outcome } => format!("call with {peer} {outcome}"),
        CallNotice::Fatal { error } => format!("signaling unavailable: {error}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beach_call::session::{CallOutcome, CallPhase};

    #[test_timeout::timeout]
    fn parses_commands() {
        assert_eq!(
            LineCommand::parse("call bob").unwrap(),
            Some(LineCommand::Call(EndpointId::new("bob").unwrap()))
        );
        assert_eq!(LineCommand::parse("  ").unwrap(), None);
        assert_eq!(LineCommand::parse("VIDEO off").unwrap(), Some(LineCommand::Video(false)));
        assert_eq!(LineCommand::parse("unmute").unwrap(), Some(LineCommand::Mute(false)));
        assert!(LineCommand::parse("call").is_err());
        assert!(LineCommand::parse("dance").is_err());
    }

    #[test_timeout::timeout]
    fn describes_state_for_humans() {
        let snapshot = CallSnapshot {
            phase: CallPhase::InCall,
            peer: Some(EndpointId::new("bob").unwrap()),
            has_local_media: true,
            muted: true,
            ..CallSnapshot::idle(EndpointId::new("alice").unwrap())
        };
        assert_eq!(describe_snapshot(&snapshot), "[in-call] peer=bob mic=off cam=on");
        let notice = CallNotice::Ended {
            peer: EndpointId::new("bob").unwrap(),
            outcome: CallOutcome::TimedOut,
        };
        assert_eq!(describe_notice(&notice), "call with bob timed out");
    }
}
