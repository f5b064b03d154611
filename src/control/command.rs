//! Command registry - Parses `{"command": "<name>", "<arg>": "<value>"}` messages

use rust_decimal::Decimal;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::core::{AlgorithmId, Currency, Error, Exchange, Result};

/// A validated control command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    StopBot,
    StopAlgorithm {
        algorithm: AlgorithmId,
    },
    GetAllocation {
        exchange: Exchange,
        algorithm: AlgorithmId,
    },
    SetAllocation {
        exchange: Exchange,
        algorithm: AlgorithmId,
        weight: Decimal,
    },
    ChangeBaseCurrency {
        currency: Currency,
    },
}

/// Named string arguments of one message
pub struct Arguments(BTreeMap<String, String>);

impl Arguments {
    fn get(&self, name: &str) -> Result<&str> {
        self.0
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| Error::Command(format!("missing argument {}", name)))
    }
}

pub struct CommandSpec {
    pub name: &'static str,
    pub arguments: &'static [&'static str],
    pub description: &'static str,
    build: fn(&Arguments) -> Result<Command>,
}

pub static COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "help",
        arguments: &[],
        description: "List the available commands",
        build: build_help,
    },
    CommandSpec {
        name: "stop_bot",
        arguments: &[],
        description: "Stop every algorithm and shut down",
        build: build_stop_bot,
    },
    CommandSpec {
        name: "stop_algorithm",
        arguments: &["arg_algorithm"],
        description: "Halt one algorithm",
        build: build_stop_algorithm,
    },
    CommandSpec {
        name: "get_allocation",
        arguments: &["arg_exchange", "arg_algorithm"],
        description: "Show the sub-portfolio of an algorithm",
        build: build_get_allocation,
    },
    CommandSpec {
        name: "set_allocation",
        arguments: &["arg_exchange", "arg_algorithm", "arg_weight"],
        description: "Change an algorithm's weight and reconfigure all allocations",
        build: build_set_allocation,
    },
    CommandSpec {
        name: "change_basecurrency",
        arguments: &["arg_currency"],
        description: "Set the currency portfolio values are reported in",
        build: build_change_basecurrency,
    },
];

fn build_help(_: &Arguments) -> Result<Command> {
    Ok(Command::Help)
}

fn build_stop_bot(_: &Arguments) -> Result<Command> {
    Ok(Command::StopBot)
}

fn build_stop_algorithm(args: &Arguments) -> Result<Command> {
    Ok(Command::StopAlgorithm {
        algorithm: AlgorithmId::new(args.get("arg_algorithm")?),
    })
}

fn build_get_allocation(args: &Arguments) -> Result<Command> {
    Ok(Command::GetAllocation {
        exchange: Exchange::new(args.get("arg_exchange")?),
        algorithm: AlgorithmId::new(args.get("arg_algorithm")?),
    })
}

fn build_set_allocation(args: &Arguments) -> Result<Command> {
    let raw = args.get("arg_weight")?;
    let weight = Decimal::from_str(raw)
        .map_err(|e| Error::Command(format!("arg_weight '{}' is not a decimal: {}", raw, e)))?;
    Ok(Command::SetAllocation {
        exchange: Exchange::new(args.get("arg_exchange")?),
        algorithm: AlgorithmId::new(args.get("arg_algorithm")?),
        weight,
    })
}

fn build_change_basecurrency(args: &Arguments) -> Result<Command> {
    let raw = args.get("arg_currency")?;
    if raw.trim().is_empty() {
        return Err(Error::Command("arg_currency must not be empty".to_string()));
    }
    Ok(Command::ChangeBaseCurrency {
        currency: Currency::new(raw),
    })
}

pub fn lookup(name: &str) -> Option<&'static CommandSpec> {
    COMMANDS.iter().find(|entry| entry.name == name)
}

/// Parse and validate a command message
pub fn parse(message: &str) -> Result<Command> {
    let mut fields: Map<String, Value> = serde_json::from_str(message)
        .map_err(|e| Error::Command(format!("message is not a JSON object: {}", e)))?;

    let name = match fields.remove("command") {
        Some(Value::String(name)) => name,
        Some(_) => return Err(Error::Command("command must be a string".to_string())),
        None => return Err(Error::Command("message has no command".to_string())),
    };
    let entry = lookup(&name).ok_or_else(|| Error::Command(format!("unknown command {}", name)))?;

    let mut arguments = BTreeMap::new();
    for (key, value) in fields {
        if !entry.arguments.contains(&key.as_str()) {
            return Err(Error::Command(format!("{} does not take argument {}", name, key)));
        }
        let value = match value {
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            other => {
                return Err(Error::Command(format!("argument {} has unsupported value {}", key, other)));
            }
        };
        arguments.insert(key, value);
    }
    for required in entry.arguments {
        if !arguments.contains_key(*required) {
            return Err(Error::Command(format!("{} requires argument {}", name, required)));
        }
    }

    (entry.build)(&Arguments(arguments))
}

/// One line per command: name, arguments and description
pub fn help() -> String {
    COMMANDS
        .iter()
        .map(|entry| {
            let args = if entry.arguments.is_empty() {
                "{}".to_string()
            } else {
                format!("{{{}}}", entry.arguments.join(", "))
            };
            format!("{} {} - {}", entry.name, args, entry.description)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
