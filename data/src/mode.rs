use crate::isupport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Add(char, Option<String>),
    Remove(char, Option<String>),
    NoPrefix(char),
}

impl Mode {
    pub fn value(&self) -> char {
        match self {
            Mode::Add(value, _) => *value,
            Mode::Remove(value, _) => *value,
            Mode::NoPrefix(value) => *value,
        }
    }

    pub fn arg(&self) -> Option<&str> {
        match self {
            Mode::Add(_, arg) => arg.as_deref(),
            Mode::Remove(_, arg) => arg.as_deref(),
            Mode::NoPrefix(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Add,
    Remove,
    None,
}

/// Whether a mode letter consumes an argument, according to the
/// server-advertised CHANMODES categories and PREFIX modes.
fn takes_arg(mode: char, operation: Operation, isupport: &isupport::Table) -> bool {
    if isupport.mode_to_prefix(mode).is_some() {
        return true;
    }

    for channel_mode in &isupport.chanmodes {
        if channel_mode.modes.contains(mode) {
            return match channel_mode.kind {
                // Type A (lists) and B always take a parameter
                'A' | 'B' => true,
                // Type C only when being set
                'C' => operation == Operation::Add,
                // Type D never
                _ => false,
            };
        }
    }

    false
}

/// Parses a mode string (`-rb+i`, args `["*@host"]`, ...) into ordered
/// deltas, pairing arguments with the modes that consume them.
pub fn parse(encoded: &str, args: &[String], isupport: &isupport::Table) -> Vec<Mode> {
    let mut args = args.iter();
    let mut operation = Operation::None;
    let mut parsed = vec![];

    for c in encoded.chars() {
        match c {
            '+' => operation = Operation::Add,
            '-' => operation = Operation::Remove,
            _ => {
                let arg = if takes_arg(c, operation, isupport) {
                    args.next().cloned()
                } else {
                    None
                };

                parsed.push(match operation {
                    Operation::Add => Mode::Add(c, arg),
                    Operation::Remove => Mode::Remove(c, arg),
                    Operation::None => Mode::NoPrefix(c),
                });
            }
        }
    }

    parsed
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::isupport;

    #[test]
    fn channel() {
        let isupport = isupport::Table::default();

        let tests = [
            ("+r", vec![], vec![Mode::Add('r', None)]),
            (
                "-r+ib",
                vec!["*!*@192.168.0.1".to_string()],
                vec![
                    Mode::Remove('r', None),
                    Mode::Add('i', None),
                    Mode::Add('b', Some("*!*@192.168.0.1".into())),
                ],
            ),
            (
                "+ol",
                vec!["oper".to_string(), "10".to_string()],
                vec![
                    Mode::Add('o', Some("oper".into())),
                    Mode::Add('l', Some("10".into())),
                ],
            ),
            // Limit takes no argument when unset
            ("-l", vec![], vec![Mode::Remove('l', None)]),
            ("b", vec![], vec![Mode::NoPrefix('b')]),
        ];

        for (modes, args, expected) in tests {
            assert_eq!(parse(modes, &args, &isupport), expected);
        }
    }
}
