// ISUPPORT Parameter References
// - https://defs.ircdocs.horse/defs/isupport.html
// - https://modern.ircdocs.horse/#rplisupport-005

use std::fmt;

/// The subset of RPL_ISUPPORT (005) tokens the client acts on.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parameter {
    CASEMAPPING(CaseMap),
    CHANMODES(Vec<ChannelMode>),
    CHANTYPES(String),
    MODES(Option<u16>),
    NETWORK(String),
    NICKLEN(u16),
    PREFIX(Vec<PrefixMap>),
    Negation(String),
}

impl<'a> TryFrom<&'a str> for Parameter {
    type Error = &'static str;

    fn try_from(isupport: &'a str) -> Result<Self, Self::Error> {
        if isupport.is_empty() {
            return Err("empty ISUPPORT parameter not allowed");
        }

        if let Some(negation) = isupport.strip_prefix('-') {
            return Ok(Parameter::Negation(negation.to_string()));
        }

        let (parameter, value) = match isupport.split_once('=') {
            Some((parameter, value)) => (parameter, value),
            None => (isupport, ""),
        };

        match parameter {
            "CASEMAPPING" => match value {
                "ascii" => Ok(Parameter::CASEMAPPING(CaseMap::ASCII)),
                "rfc1459" => Ok(Parameter::CASEMAPPING(CaseMap::RFC1459)),
                "rfc1459-strict" => Ok(Parameter::CASEMAPPING(CaseMap::RFC1459_STRICT)),
                _ => Err("unknown casemapping"),
            },
            "CHANMODES" => {
                let mut channel_modes = vec![];

                ('A'..='Z')
                    .zip(value.split(','))
                    .for_each(|(kind, modes)| {
                        channel_modes.push(ChannelMode {
                            kind,
                            modes: String::from(modes),
                        })
                    });

                if !channel_modes.is_empty() {
                    Ok(Parameter::CHANMODES(channel_modes))
                } else {
                    Err("no valid channel modes")
                }
            }
            "CHANTYPES" => Ok(Parameter::CHANTYPES(value.to_string())),
            "MODES" => Ok(Parameter::MODES(value.parse().ok())),
            "NETWORK" => {
                if !value.is_empty() {
                    Ok(Parameter::NETWORK(value.to_string()))
                } else {
                    Err("empty network name")
                }
            }
            "NICKLEN" => value
                .parse()
                .map(Parameter::NICKLEN)
                .map_err(|_| "invalid NICKLEN"),
            "PREFIX" => {
                // PREFIX=(ov)@+
                let mut prefix_maps = vec![];

                if let Some((modes, prefixes)) = value
                    .strip_prefix('(')
                    .and_then(|value| value.split_once(')'))
                {
                    for (mode, prefix) in modes.chars().zip(prefixes.chars()) {
                        prefix_maps.push(PrefixMap { mode, prefix });
                    }
                }

                if !prefix_maps.is_empty() || value.is_empty() {
                    Ok(Parameter::PREFIX(prefix_maps))
                } else {
                    Err("invalid PREFIX")
                }
            }
            _ => Err("unsupported ISUPPORT parameter"),
        }
    }
}

/// Aggregated view of the server-advertised feature tokens, with the
/// RFC defaults until the server says otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub casemap: CaseMap,
    pub chantypes: String,
    pub chanmodes: Vec<ChannelMode>,
    pub prefix: Vec<PrefixMap>,
    pub network: Option<String>,
}

impl Default for Table {
    fn default() -> Self {
        Self {
            casemap: CaseMap::RFC1459,
            chantypes: String::from("#&"),
            chanmodes: vec![
                ChannelMode {
                    kind: 'A',
                    modes: "beI".into(),
                },
                ChannelMode {
                    kind: 'B',
                    modes: "k".into(),
                },
                ChannelMode {
                    kind: 'C',
                    modes: "l".into(),
                },
                ChannelMode {
                    kind: 'D',
                    modes: "imnpst".into(),
                },
            ],
            prefix: vec![
                PrefixMap {
                    mode: 'o',
                    prefix: '@',
                },
                PrefixMap {
                    mode: 'v',
                    prefix: '+',
                },
            ],
            network: None,
        }
    }
}

impl Table {
    pub fn apply(&mut self, parameter: Parameter) {
        match parameter {
            Parameter::CASEMAPPING(casemap) => self.casemap = casemap,
            Parameter::CHANMODES(chanmodes) => self.chanmodes = chanmodes,
            Parameter::CHANTYPES(chantypes) if !chantypes.is_empty() => {
                self.chantypes = chantypes;
            }
            Parameter::CHANTYPES(_) => {}
            Parameter::NETWORK(network) => self.network = Some(network),
            Parameter::PREFIX(prefix) => self.prefix = prefix,
            Parameter::MODES(_) | Parameter::NICKLEN(_) | Parameter::Negation(_) => {}
        }
    }

    pub fn is_channel(&self, target: &str) -> bool {
        target.starts_with(|c| self.chantypes.contains(c))
    }

    pub fn prefix_to_mode(&self, prefix: char) -> Option<char> {
        self.prefix
            .iter()
            .find(|map| map.prefix == prefix)
            .map(|map| map.mode)
    }

    pub fn mode_to_prefix(&self, mode: char) -> Option<char> {
        self.prefix
            .iter()
            .find(|map| map.mode == mode)
            .map(|map| map.prefix)
    }

    pub fn membership_prefixes(&self) -> Vec<char> {
        self.prefix.iter().map(|map| map.prefix).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(non_camel_case_types)]
pub enum CaseMap {
    ASCII,
    #[default]
    RFC1459,
    RFC1459_STRICT,
}

impl CaseMap {
    /// Canonical (lowercase) form used for storage and lookup.
    pub fn lower(&self, value: &str) -> String {
        value
            .chars()
            .map(|c| match self {
                CaseMap::ASCII => c.to_ascii_lowercase(),
                CaseMap::RFC1459 => match c {
                    '[' => '{',
                    ']' => '}',
                    '\\' => '|',
                    '~' => '^',
                    _ => c.to_ascii_lowercase(),
                },
                CaseMap::RFC1459_STRICT => match c {
                    '[' => '{',
                    ']' => '}',
                    '\\' => '|',
                    _ => c.to_ascii_lowercase(),
                },
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefixMap {
    pub mode: char,
    pub prefix: char,
}

impl fmt::Display for PrefixMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.prefix)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMode {
    pub kind: char,
    pub modes: String,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parameters() {
        let tests = [
            (
                "CASEMAPPING=rfc1459",
                Parameter::CASEMAPPING(CaseMap::RFC1459),
            ),
            ("CHANTYPES=#", Parameter::CHANTYPES("#".into())),
            ("NETWORK=Libera.Chat", Parameter::NETWORK("Libera.Chat".into())),
            (
                "PREFIX=(qaohv)~&@%+",
                Parameter::PREFIX(vec![
                    PrefixMap {
                        mode: 'q',
                        prefix: '~',
                    },
                    PrefixMap {
                        mode: 'a',
                        prefix: '&',
                    },
                    PrefixMap {
                        mode: 'o',
                        prefix: '@',
                    },
                    PrefixMap {
                        mode: 'h',
                        prefix: '%',
                    },
                    PrefixMap {
                        mode: 'v',
                        prefix: '+',
                    },
                ]),
            ),
            ("-EXCEPTS", Parameter::Negation("EXCEPTS".into())),
        ];

        for (input, expected) in tests {
            assert_eq!(Parameter::try_from(input).unwrap(), expected);
        }
    }

    #[test]
    fn chanmodes() {
        let Parameter::CHANMODES(modes) =
            Parameter::try_from("CHANMODES=b,k,l,imnst").unwrap()
        else {
            panic!("expected CHANMODES");
        };

        assert_eq!(modes.len(), 4);
        assert_eq!(modes[0].kind, 'A');
        assert_eq!(modes[0].modes, "b");
        assert_eq!(modes[3].kind, 'D');
        assert_eq!(modes[3].modes, "imnst");
    }

    #[test]
    fn casemap_lower() {
        assert_eq!(CaseMap::RFC1459.lower("Nick[a]\\~"), "nick{a}|^");
        assert_eq!(CaseMap::RFC1459_STRICT.lower("Nick~"), "nick~");
        assert_eq!(CaseMap::ASCII.lower("Nick[]"), "nick[]");
    }
}
