// Reference: https://rawgit.com/DanielOaks/irc-rfcs/master/dist/draft-oakley-irc-ctcp-latest.html

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Action,
    ClientInfo,
    DCC,
    Ping,
    Time,
    Version,
    Unknown(String),
}

#[derive(Debug)]
pub struct Query<'a> {
    pub command: Command,
    pub params: Option<&'a str>,
}

pub fn is_query(text: &str) -> bool {
    text.starts_with('\u{1}')
}

pub fn parse_query(text: &str) -> Option<Query> {
    let query = text
        .strip_suffix('\u{1}')
        .unwrap_or(text)
        .strip_prefix('\u{1}')?;

    let (command, params) = if let Some((command, params)) = query.split_once(char::is_whitespace)
    {
        (command.to_uppercase(), Some(params))
    } else {
        (query.to_uppercase(), None)
    };

    let command = match command.as_ref() {
        "ACTION" => Command::Action,
        "CLIENTINFO" => Command::ClientInfo,
        "DCC" => Command::DCC,
        "PING" => Command::Ping,
        "TIME" => Command::Time,
        "VERSION" => Command::Version,
        _ => Command::Unknown(command),
    };

    Some(Query { command, params })
}

pub fn format(command: &Command, params: Option<&str>) -> String {
    let command = match command {
        Command::Action => "ACTION",
        Command::ClientInfo => "CLIENTINFO",
        Command::DCC => "DCC",
        Command::Ping => "PING",
        Command::Time => "TIME",
        Command::Version => "VERSION",
        Command::Unknown(command) => command.as_ref(),
    };

    if let Some(params) = params {
        format!("\u{1}{command} {params}\u{1}")
    } else {
        format!("\u{1}{command}\u{1}")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn queries() {
        let query = parse_query("\u{1}ACTION waves\u{1}").unwrap();
        assert_eq!(query.command, Command::Action);
        assert_eq!(query.params, Some("waves"));

        let query = parse_query("\u{1}VERSION\u{1}").unwrap();
        assert_eq!(query.command, Command::Version);
        assert_eq!(query.params, None);

        assert!(parse_query("no ctcp here").is_none());
    }

    #[test]
    fn round_trip() {
        assert_eq!(format(&Command::Ping, Some("12345")), "\u{1}PING 12345\u{1}");
        assert_eq!(format(&Command::Version, None), "\u{1}VERSION\u{1}");
    }
}
