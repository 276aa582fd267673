use std::string::FromUtf8Error;

use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::character::complete::{alpha1, char, none_of, one_of, satisfy};
use nom::combinator::{eof, map, opt, peek, recognize, value};
use nom::multi::{many0, many0_count, many1, many1_count, many_m_n, separated_list1};
use nom::sequence::{preceded, terminated, tuple};
use nom::{Finish, IResult};

use crate::{Command, Message, Source, Tags, User, LINE_BYTE_LIMIT};

pub fn message_bytes(bytes: Vec<u8>) -> Result<Message, Error> {
    let input = String::from_utf8(bytes)?;
    message(&input)
}

/// Parses a single IRC message. The line may be terminated by CR, LF or
/// CRLF; unterminated input (as handed over by the framing layer) is
/// accepted as well.
pub fn message(input: &str) -> Result<Message, Error> {
    if input.len() > LINE_BYTE_LIMIT {
        return Err(Error::LineTooLong(input.len()));
    }
    if input.contains('\0') {
        return Err(Error::Nul);
    }

    let mut message = terminated(
        tuple((opt(tags), opt(source), command)),
        // Allow trailing whitespace and stray \r before the terminator
        preceded(
            many0(one_of(" \r")),
            alt((tag("\r\n"), tag("\n"), tag("\r"), eof)),
        ),
    );

    message(input)
        .finish()
        .map(|(_, (tags, source, command))| Message {
            tags: tags.unwrap_or_default(),
            source,
            command,
        })
        .map_err(|_| Error::Malformed {
            input: input.to_string(),
        })
}

fn tags(input: &str) -> IResult<&str, Tags> {
    let escaped_char = alt((
        value(';', tag(r"\:")),
        value(' ', tag(r"\s")),
        value('\\', tag(r"\\")),
        value('\r', tag(r"\r")),
        value('\n', tag(r"\n")),
        // drop escape char '\'
        preceded(char('\\'), none_of(r":s\rn ")),
    ));
    // <sequence of any escaped characters except NUL, CR, LF, semicolon (`;`) and SPACE>
    let escaped_value = map(
        terminated(
            many0(alt((escaped_char, none_of("\0\r\n;\\ ")))),
            // drop trailing escape char '\'
            opt(char('\\')),
        ),
        |value| value.into_iter().collect::<String>(),
    );
    // '+'
    let client_prefix = char('+');
    // [ <client_prefix> ] [ <vendor> '/' ] <sequence of letters, digits, hyphens (`-`)>
    let key = recognize(tuple((
        opt(client_prefix),
        opt(terminated(many1_count(none_of("/ ;=")), char('/'))),
        many1_count(satisfy(|c| c.is_ascii_alphanumeric() || c == '-')),
    )));
    // <key> ['=' <escaped value>]
    let tag = map(
        tuple((key, opt(preceded(char('='), escaped_value)))),
        |(key, value): (&str, Option<String>)| {
            (key.to_lowercase(), value.unwrap_or_default())
        },
    );
    // <tag> [';' <tag>]*
    let tags = separated_list1(char(';'), tag);
    // '@' <tags> <SPACE>
    map(
        preceded(char('@'), terminated(tags, space)),
        |pairs| pairs.into_iter().collect::<Tags>(),
    )(input)
}

fn source(input: &str) -> IResult<&str, Source> {
    // <servername> / <user>
    let source = alt((
        map(terminated(user, peek(space)), Source::User),
        // Default all non-valid users to server
        map(
            terminated(recognize(many1(none_of(" "))), peek(space)),
            |host| Source::Server(host.to_string()),
        ),
    ));
    // ':' <source> <SPACE>
    terminated(preceded(char(':'), source), space)(input)
}

fn command(input: &str) -> IResult<&str, Command> {
    // <sequence of any characters except NUL, CR, LF, colon (`:`) and SPACE>
    let nospcrlfcl = |input| recognize(many1_count(none_of("\0\r\n: ")))(input);
    // *( ":" / " " / nospcrlfcl )
    let trailing = recognize(many0_count(alt((tag(":"), tag(" "), nospcrlfcl))));
    // nospcrlfcl *( ":" / nospcrlfcl )
    let middle = recognize(tuple((
        nospcrlfcl,
        many0_count(alt((tag(":"), nospcrlfcl))),
    )));
    // *( SPACE middle ) [ SPACE ":" trailing ]
    let parameters = tuple((
        many0(preceded(space, middle)),
        opt(preceded(space, preceded(char(':'), trailing))),
    ));
    // letter* / 3digit
    let command = alt((
        alpha1,
        recognize(many_m_n(3, 3, satisfy(|c| c.is_ascii_digit()))),
    ));
    // <command> <parameters>
    let (input, (command, (leading, trailing))) = tuple((command, parameters))(input)?;

    let parameters = leading
        .into_iter()
        .chain(trailing)
        .map(String::from)
        .collect();

    Ok((input, Command::new(command, parameters)))
}

fn space(input: &str) -> IResult<&str, ()> {
    map(many1_count(char(' ')), |_| ())(input)
}

fn user(input: &str) -> IResult<&str, User> {
    // <sequence of any characters except NUL, CR, LF, and SPACE> and @
    let username = recognize(many1_count(none_of("\0\r\n @")));
    // "-", "[", "]", "\", "`", "_", "^", "{", "|", "}", "*", "/", "@"
    let special = |input| one_of("-[]\\`_^{|}*/@")(input);
    // *( <letter> | <number> | <special> )
    let nickname = recognize(many1_count(alt((
        satisfy(|c| c.is_ascii_alphanumeric()),
        special,
    ))));
    // Parse remainder after @ as hostname
    let hostname = recognize(many1_count(none_of(" ")));
    // ( <nickname> [ "!" <user> ] [ "@" <host> ] )
    map(
        tuple((
            nickname,
            opt(preceded(char('!'), username)),
            opt(preceded(char('@'), hostname)),
        )),
        |(nickname, username, hostname): (&str, Option<&str>, Option<&str>)| User {
            nickname: nickname.to_string(),
            username: username.map(ToString::to_string),
            hostname: hostname.map(ToString::to_string),
        },
    )(input)
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed line: {input:?}")]
    Malformed { input: String },
    #[error("line exceeds {LINE_BYTE_LIMIT} bytes ({0})")]
    LineTooLong(usize),
    #[error("line contains NUL")]
    Nul,
    #[error("invalid utf-8 encoding")]
    InvalidUtf8(#[from] FromUtf8Error),
}

#[cfg(test)]
mod test {
    use nom::combinator::all_consuming;

    use crate::command::Numeric::*;
    use crate::{tags, Command, Message, Source, User};

    #[test]
    fn user() {
        let tests = [
            "dan!d@localhost",
            "test!test@5555:5555:0:55:5555:5555:5555:5555",
            "[asdf]!~asdf@user/asdf/x-5555555",
        ];

        for test in tests {
            all_consuming(super::user)(test).unwrap();
        }
    }

    #[test]
    fn source() {
        let tests = [
            (
                ":irc.example.com ",
                Source::Server("irc.example.com".into()),
            ),
            (
                ":dan!d@localhost ",
                Source::User(User {
                    nickname: "dan".into(),
                    username: Some("d".into()),
                    hostname: Some("localhost".into()),
                }),
            ),
            (":*.libera.chat ", Source::Server("*.libera.chat".into())),
            (":1.1.1.1 ", Source::Server("1.1.1.1".to_string())),
        ];

        for (test, expected) in tests {
            let (_, source) = super::source(test).unwrap();
            assert_eq!(source, expected);
        }
    }

    #[test]
    fn message() {
        let tests = [
            (
                ":irc.example.com CAP LS * :multi-prefix extended-join sasl\r\n",
                Message {
                    tags: tags![],
                    source: Some(Source::Server("irc.example.com".to_string())),
                    command: Command::CAP(
                        Some("LS".to_string()),
                        "*".to_string(),
                        Some("multi-prefix extended-join sasl".to_string()),
                        None,
                    ),
                },
            ),
            (
                "@time=2024-01-01T00:00:00.000Z;account=bob :bob!b@h PRIVMSG #chan :hello world\r\n",
                Message {
                    tags: tags![
                        "time" => "2024-01-01T00:00:00.000Z",
                        "account" => "bob",
                    ],
                    source: Some(Source::User(User {
                        nickname: "bob".into(),
                        username: Some("b".into()),
                        hostname: Some("h".into()),
                    })),
                    command: Command::PRIVMSG("#chan".to_string(), "hello world".to_string()),
                },
            ),
            // Bare LF termination
            (
                "CAP REQ :sasl\n",
                Message {
                    tags: tags![],
                    source: None,
                    command: Command::CAP(Some("REQ".to_string()), "sasl".to_string(), None, None),
                },
            ),
            // No terminator at all
            (
                "PING :token",
                Message {
                    tags: tags![],
                    source: None,
                    command: Command::PING("token".to_string()),
                },
            ),
            // Tag escapes, dropped lone escape chars, uppercased key
            (
                "@Tag=as\\\\\\:\\sdf\\z\\ UNKNOWN\r\n",
                Message {
                    tags: tags!["tag" => "as\\; dfz"],
                    source: None,
                    command: Command::Unknown("UNKNOWN".to_string(), vec![]),
                },
            ),
            // Escaped separators round back to the raw value
            (
                "@k=a\\:b\\sc\\\\d TAGTEST\r\n",
                Message {
                    tags: tags!["k" => "a;b c\\d"],
                    source: None,
                    command: Command::Unknown("TAGTEST".to_string(), vec![]),
                },
            ),
            // Valueless and empty-valued tags are equivalent
            (
                "@a;b= PING :x\r\n",
                Message {
                    tags: tags!["a" => "", "b" => ""],
                    source: None,
                    command: Command::PING("x".to_string()),
                },
            ),
            (
                ":atw.hu.quakenet.org 001 test :Welcome to the QuakeNet IRC Network, test\r\n",
                Message {
                    tags: tags![],
                    source: Some(Source::Server("atw.hu.quakenet.org".to_string())),
                    command: Command::Numeric(
                        RPL_WELCOME,
                        vec![
                            "test".to_string(),
                            "Welcome to the QuakeNet IRC Network, test".to_string(),
                        ],
                    ),
                },
            ),
            // Lowercase verb is uppercased
            (
                "privmsg #a :b\r\n",
                Message {
                    tags: tags![],
                    source: None,
                    command: Command::PRIVMSG("#a".to_string(), "b".to_string()),
                },
            ),
            // Extra \r before the terminator
            (
                ":foo!~foo@host JOIN #pixelcove * :foo\r\r\n",
                Message {
                    tags: tags![],
                    source: Some(Source::User(User {
                        nickname: "foo".into(),
                        username: Some("~foo".into()),
                        hostname: Some("host".into()),
                    })),
                    command: Command::JOIN("#pixelcove".to_string(), Some("*".to_string())),
                },
            ),
            // Space between message and crlf
            (
                ":server.example MODE #test +nt \r\n",
                Message {
                    tags: tags![],
                    source: Some(Source::Server("server.example".to_string())),
                    command: Command::MODE(
                        "#test".to_string(),
                        Some("+nt".to_string()),
                        Some(vec![]),
                    ),
                },
            ),
        ];

        for (test, expected) in tests {
            let message = super::message(test).unwrap();
            assert_eq!(message, expected);
        }
    }

    #[test]
    fn malformed() {
        // Missing verb
        assert!(matches!(
            super::message(":irc.example.com \r\n"),
            Err(super::Error::Malformed { .. })
        ));
        // Stray NUL
        assert!(matches!(
            super::message("PRIVMSG #a :b\0c\r\n"),
            Err(super::Error::Nul)
        ));
        // Oversize
        let long = format!("PRIVMSG #a :{}\r\n", "x".repeat(super::LINE_BYTE_LIMIT));
        assert!(matches!(
            super::message(&long),
            Err(super::Error::LineTooLong(_))
        ));
    }
}
