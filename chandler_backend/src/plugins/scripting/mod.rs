//! Per-group rule bindings.
//!
//! Rules map an event name to a list of commands. Running an event returns
//! the commands that affect other parts of the board, which the board then
//! executes with a bounded redirect depth.

use std::collections::BTreeMap;

use tracing::warn;

use crate::plugins::groups::cue::Rule;
use crate::utilities::expressions::{self, Value, VariableScope};

/// Something a rule asked the board to do
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptCommand {
	Goto { group: String, cue: String },
	SetAlpha { group: String, alpha: f64 },
	Shortcut { code: String },
	Stop { group: String },
	/// A rule wrote one of the group's own variables
	SetVar { name: String, value: Value },
}

/// Variables and rule bindings of one group.
pub trait ScriptContext: Send {
	fn set_var(&mut self, name: &str, value: Value);
	fn get_var(&self, name: &str) -> Option<Value>;

	/// View used to evaluate expressions against this context's variables
	fn as_scope(&self) -> &dyn VariableScope;

	fn clear_bindings(&mut self);
	/// Drops all variables
	fn clear_state(&mut self);
	fn add_bindings(&mut self, rules: &[Rule]);

	/// Fires `name` and returns the board-level commands of every matching rule.
	fn event(&mut self, name: &str, value: &Value) -> Vec<ScriptCommand>;
}

/// Default [`ScriptContext`]: a variable map plus a flat rule list.
///
/// Commands: `goto <group> <cue>`, `set_alpha <group> <value>`,
/// `shortcut <code>`, `set <var> <value>`, `stop <group>`, `pass`.
/// Arguments starting with `=` are evaluated with this context's variables.
#[derive(Debug, Default, Clone)]
pub struct RulesEngine {
	variables: BTreeMap<String, Value>,
	bindings: Vec<Rule>,
}

impl RulesEngine {
	pub fn new() -> Self {
		return RulesEngine::default();
	}

	pub fn bindings(&self) -> &[Rule] {
		return &self.bindings;
	}

	fn argument(&self, raw: &str) -> Result<Value, expressions::ExpressionError> {
		return expressions::resolve(raw, &self.variables);
	}

	fn text_argument(&self, raw: &str) -> Result<String, expressions::ExpressionError> {
		return Ok(self.argument(raw)?.to_string());
	}

	fn run_command(&mut self, command: &[String]) -> Result<Option<ScriptCommand>, String> {
		let Some((name, args)) = command.split_first() else {
			return Ok(None);
		};

		return match name.as_str() {
			"pass" | "" => Ok(None),
			"goto" => Ok(Some(ScriptCommand::Goto {
				group: self.text_arg(name, args, 0)?,
				cue: self.text_arg(name, args, 1)?,
			})),
			"set_alpha" => {
				let alpha = self.argument(nth_arg(name, args, 1)?).map_err(|e| e.to_string())?;
				let alpha = alpha.as_number().ok_or_else(|| format!("set_alpha: {alpha} is not a number"))?;
				Ok(Some(ScriptCommand::SetAlpha {
					group: self.text_arg(name, args, 0)?,
					alpha,
				}))
			}
			"shortcut" => Ok(Some(ScriptCommand::Shortcut {
				code: self.text_arg(name, args, 0)?,
			})),
			"stop" => Ok(Some(ScriptCommand::Stop {
				group: self.text_arg(name, args, 0)?,
			})),
			"set" => {
				let var = String::from(nth_arg(name, args, 0)?);
				let value = self.argument(nth_arg(name, args, 1)?).map_err(|e| e.to_string())?;
				// Later commands of the same rule read it straight away
				self.variables.insert(var.clone(), value.clone());
				Ok(Some(ScriptCommand::SetVar { name: var, value }))
			}
			other => Err(format!("unknown command {other:?}")),
		};
	}

	fn text_arg(&self, command: &str, args: &[String], index: usize) -> Result<String, String> {
		return self
			.text_argument(nth_arg(command, args, index)?)
			.map_err(|e| e.to_string());
	}
}

fn nth_arg<'a>(command: &str, args: &'a [String], index: usize) -> Result<&'a str, String> {
	return args
		.get(index)
		.map(String::as_str)
		.ok_or_else(|| format!("{command}: missing argument {}", index + 1));
}

impl VariableScope for RulesEngine {
	fn get_var(&self, name: &str) -> Option<Value> {
		return self.variables.get(name).cloned();
	}
}

impl ScriptContext for RulesEngine {
	fn set_var(&mut self, name: &str, value: Value) {
		self.variables.insert(String::from(name), value);
	}

	fn get_var(&self, name: &str) -> Option<Value> {
		return self.variables.get(name).cloned();
	}

	fn as_scope(&self) -> &dyn VariableScope {
		return self;
	}

	fn clear_bindings(&mut self) {
		self.bindings.clear();
	}

	fn clear_state(&mut self) {
		self.variables.clear();
	}

	fn add_bindings(&mut self, rules: &[Rule]) {
		self.bindings.extend(rules.iter().cloned());
	}

	fn event(&mut self, name: &str, value: &Value) -> Vec<ScriptCommand> {
		let matching: Vec<Vec<Vec<String>>> = self
			.bindings
			.iter()
			.filter(|rule| rule.0 == name)
			.map(|rule| rule.1.clone())
			.collect();
		if matching.is_empty() {
			return Vec::new();
		}

		self.variables.insert(String::from("event"), value.clone());
		let mut out = Vec::new();
		for commands in matching {
			for command in commands {
				match self.run_command(&command) {
					Ok(Some(cmd)) => out.push(cmd),
					Ok(None) => {}
					Err(err) => {
						// Stop this rule's chain, like an exception would
						warn!(event = name, error = %err, "Script command failed");
						break;
					}
				}
			}
		}
		return out;
	}
}
