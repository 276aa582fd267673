use std::fmt::Write;

use itertools::Itertools;

use crate::{Command, Message, Source, Tags};

pub fn message(message: Message) -> String {
    let mut output = String::with_capacity(crate::BYTE_LIMIT);

    let tags = tags(message.tags);

    if !tags.is_empty() {
        let _ = write!(&mut output, "@{tags} ");
    }

    if let Some(source) = &message.source {
        let _ = write!(&mut output, ":{} ", self::source(source));
    }

    if let Command::Raw(raw) = &message.command {
        let _ = write!(&mut output, "{raw}");
    } else {
        let command = message.command.command();
        let params = parameters(message.command.parameters());

        let _ = write!(&mut output, "{command} {params}");
    }

    let _ = write!(&mut output, "\r\n");

    output
}

fn source(source: &Source) -> String {
    match source {
        Source::Server(server) => server.clone(),
        Source::User(user) => {
            let mut out = user.nickname.clone();
            if let Some(username) = &user.username {
                let _ = write!(&mut out, "!{username}");
            }
            if let Some(hostname) = &user.hostname {
                let _ = write!(&mut out, "@{hostname}");
            }
            out
        }
    }
}

fn tags(tags: Tags) -> String {
    tags.into_iter().map(tag).join(";")
}

fn tag((key, value): (String, String)) -> String {
    if value.is_empty() {
        return key;
    }

    let mappings = [
        ('\\', r"\\"),
        (';', r"\:"),
        (' ', r"\s"),
        ('\r', r"\r"),
        ('\n', r"\n"),
    ];

    let escaped = mappings
        .into_iter()
        .fold(value, |value, (from, to)| value.replace(from, to));

    format!("{key}={escaped}")
}

fn parameters(parameters: Vec<String>) -> String {
    let params_len = parameters.len();
    parameters
        .into_iter()
        .enumerate()
        .map(|(index, param)| {
            if index == params_len - 1 {
                trailing(param)
            } else {
                param
            }
        })
        .join(" ")
}

fn trailing(parameter: String) -> String {
    if parameter.contains(' ') || parameter.is_empty() || parameter.starts_with(':') {
        format!(":{parameter}")
    } else {
        parameter
    }
}
