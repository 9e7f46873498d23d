use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::GroupError;
use crate::utilities::expressions::{self, ExpressionError, Value, VariableScope};

/// Characters allowed in cue names besides alphanumerics and spaces
const CUE_NAME_SPECIALS: &str = "_~.";

/// A raw cue field: number, text (possibly an `=expression`), or null.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CueValue {
	#[default]
	Null,
	Number(f64),
	Text(String),
}

impl CueValue {
	pub fn is_null(&self) -> bool {
		return matches!(self, CueValue::Null);
	}

	pub fn is_expression(&self) -> bool {
		return matches!(self, CueValue::Text(text) if expressions::is_expression(text));
	}

	/// Evaluates to a number. Null is zero; plain text must parse as a number.
	pub fn evaluate(&self, scope: &dyn VariableScope) -> Result<f64, ExpressionError> {
		return match self {
			CueValue::Null => Ok(0.0),
			CueValue::Number(n) => Ok(*n),
			CueValue::Text(text) if text.trim().is_empty() => Ok(0.0),
			CueValue::Text(text) => expressions::resolve_number(text, scope),
		};
	}

	/// Like [`evaluate`](Self::evaluate) but keeps non-numeric results
	pub fn resolve(&self, scope: &dyn VariableScope) -> Result<Value, ExpressionError> {
		return match self {
			CueValue::Null => Ok(Value::Null),
			CueValue::Number(n) => Ok(Value::Number(*n)),
			CueValue::Text(text) => expressions::resolve(text, scope),
		};
	}
}

impl From<f64> for CueValue {
	fn from(value: f64) -> Self {
		return CueValue::Number(value);
	}
}

impl From<&str> for CueValue {
	fn from(value: &str) -> Self {
		return CueValue::Text(String::from(value));
	}
}

/// `[event, [[command, arg...], ...]]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule(pub String, pub Vec<Vec<String>>);

impl Rule {
	pub fn new(event: &str, commands: &[&[&str]]) -> Self {
		return Rule(
			String::from(event),
			commands
				.iter()
				.map(|command| command.iter().map(|s| String::from(*s)).collect())
				.collect(),
		);
	}
}

/// Sparse values: universe or `@fixture` reference -> channel -> value
pub type CueValues = BTreeMap<String, BTreeMap<String, CueValue>>;

/// A snapshot of channel values plus timing and behaviour for one step of a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Cue {
	pub id: Uuid,
	pub name: String,
	/// Sort key, the displayed number times 1000
	pub number: i64,
	pub values: CueValues,
	pub fade_in: f64,
	/// Seconds, `@recurrence` or `=expression`. Zero means no time limit.
	pub length: CueValue,
	pub length_randomize: f64,
	pub next_cue: String,
	pub track: bool,
	pub reentrant: bool,
	pub shortcut: String,
	pub trigger_shortcut: String,
	/// Weight for random selection, blank means 1
	pub probability: CueValue,
	pub sound: String,
	pub slide: String,
	/// Length is relative to the media duration
	pub rel_length: bool,
	pub sound_start_position: CueValue,
	pub media_speed: CueValue,
	pub media_wind_up: CueValue,
	/// Negative loops forever
	pub sound_loops: i64,
	pub checkpoint: bool,
	pub rules: Vec<Rule>,
	pub inherit_rules: String,
	/// Absolute `@recurrence` start time
	pub schedule_at: String,
	pub markdown: String,
	pub notes: String,
	pub metadata: BTreeMap<String, Value>,
	#[serde(skip)]
	pub error_lockout: bool,
}

impl Default for Cue {
	fn default() -> Self {
		return Cue {
			id: Uuid::new_v4(),
			name: String::from("default"),
			number: 5000,
			values: BTreeMap::new(),
			fade_in: 0.0,
			length: CueValue::Number(0.0),
			length_randomize: 0.0,
			next_cue: String::new(),
			track: true,
			reentrant: true,
			shortcut: String::new(),
			trigger_shortcut: String::new(),
			probability: CueValue::Null,
			sound: String::new(),
			slide: String::new(),
			rel_length: false,
			sound_start_position: CueValue::Number(0.0),
			media_speed: CueValue::Number(1.0),
			media_wind_up: CueValue::Number(0.0),
			sound_loops: 0,
			checkpoint: false,
			rules: Vec::new(),
			inherit_rules: String::new(),
			schedule_at: String::new(),
			markdown: String::new(),
			notes: String::new(),
			metadata: BTreeMap::new(),
			error_lockout: false,
		};
	}
}

impl Cue {
	pub fn new(name: &str, number: i64) -> Result<Self, GroupError> {
		return Ok(Cue {
			name: normalize_cue_name(name)?,
			number,
			..Cue::default()
		});
	}

	pub fn is_special(&self) -> bool {
		return self.name.starts_with("__");
	}

	/// Sets or clears one sparse value. Returns true if the set of
	/// addressed channels changed, which needs a full recompute.
	pub fn set_value(&mut self, universe: &str, channel: &str, value: Option<CueValue>) -> bool {
		match value {
			Some(value) => {
				let channels = self.values.entry(String::from(universe)).or_default();
				let added = !channels.contains_key(channel);
				channels.insert(String::from(channel), value);
				return added;
			}
			None => {
				let Some(channels) = self.values.get_mut(universe) else {
					return false;
				};
				let removed = channels.remove(channel).is_some();
				if channels.is_empty() {
					self.values.remove(universe);
				}
				return removed;
			}
		}
	}

	pub fn get_value(&self, universe: &str, channel: &str) -> Option<&CueValue> {
		return self.values.get(universe)?.get(channel);
	}

	/// Normalizes and sets the absolute schedule, adding the `@` if missing.
	pub fn set_schedule_at(&mut self, rule: &str) -> Result<(), GroupError> {
		let rule = rule.trim();
		if rule.is_empty() {
			self.schedule_at.clear();
			return Ok(());
		}
		let rule = if rule.starts_with('@') { String::from(rule) } else { format!("@{rule}") };
		crate::utilities::recurrence::Recurrence::parse(&rule)?;
		self.schedule_at = rule;
		return Ok(());
	}

	/// Display form of the cue number
	pub fn number_text(&self) -> String {
		return number_to_shortcut(self.number);
	}
}

/// Validates a cue name. Names that start with a digit get an `x` prefix.
pub fn normalize_cue_name(raw: &str) -> Result<String, GroupError> {
	let name = raw.trim();
	if name.is_empty() {
		return Err(GroupError::InvalidCueName(String::from(raw)));
	}
	if name
		.chars()
		.any(|c| !(c.is_alphanumeric() || c == ' ' || CUE_NAME_SPECIALS.contains(c)))
	{
		return Err(GroupError::InvalidCueName(String::from(raw)));
	}
	if name.starts_with(|c: char| c.is_ascii_digit()) {
		return Ok(format!("x{name}"));
	}
	return Ok(String::from(name));
}

/// Renders a fixed-point cue number as `number / 1000` with at most three
/// decimals and no trailing zeros: `5000 -> "5"`, `5500 -> "5.5"`.
pub fn number_to_shortcut(number: i64) -> String {
	let sign = if number < 0 { "-" } else { "" };
	let whole = number.unsigned_abs() / 1000;
	let frac = number.unsigned_abs() % 1000;
	if frac == 0 {
		return format!("{sign}{whole}");
	}
	let frac = format!("{frac:03}");
	return format!("{sign}{whole}.{}", frac.trim_end_matches('0'));
}

/// Parses a displayed cue number ("5.5") into fixed point (5500).
pub fn parse_cue_number(text: &str) -> Option<i64> {
	let value: f64 = text.trim().parse().ok()?;
	if !value.is_finite() {
		return None;
	}
	return Some((value * 1000.0).round() as i64);
}

/// Shortcut codes that look like numbers lose trailing zeros: "5.50" -> "5.5"
pub fn normalize_shortcut(code: &str) -> String {
	let code = code.trim();
	if let Ok(value) = code.parse::<f64>() {
		if value.is_finite() {
			let rounded = (value * 10000.0).round() / 10000.0;
			if rounded.fract() == 0.0 && rounded.abs() < 1e15 {
				return format!("{}", rounded as i64);
			}
			return format!("{rounded}");
		}
	}
	return String::from(code);
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::utilities::expressions::NoVariables;

	#[test]
	fn names_are_validated() {
		assert_eq!(normalize_cue_name("  intro ").unwrap(), "intro");
		assert_eq!(normalize_cue_name("3rd look").unwrap(), "x3rd look");
		assert_eq!(normalize_cue_name("a_b~c.d").unwrap(), "a_b~c.d");
		assert!(normalize_cue_name("").is_err());
		assert!(normalize_cue_name("bad/name").is_err());
		assert!(normalize_cue_name("what?").is_err());
	}

	#[test]
	fn numbers_render_without_trailing_zeros() {
		assert_eq!(number_to_shortcut(5000), "5");
		assert_eq!(number_to_shortcut(5500), "5.5");
		assert_eq!(number_to_shortcut(5050), "5.05");
		assert_eq!(number_to_shortcut(1), "0.001");
		assert_eq!(parse_cue_number("5.5"), Some(5500));
		assert_eq!(normalize_shortcut("5.50"), "5.5");
		assert_eq!(normalize_shortcut("7.0"), "7");
		assert_eq!(normalize_shortcut("go"), "go");
	}

	#[test]
	fn values_parse_from_json() {
		let cue: Cue = serde_json::from_str(
			r#"{"name": "c", "values": {"u1": {"5": "=1+1", "6": 20, "7": null}}, "length": "@every 5 minutes"}"#,
		)
		.unwrap();
		assert_eq!(cue.get_value("u1", "6"), Some(&CueValue::Number(20.0)));
		assert_eq!(cue.get_value("u1", "7"), Some(&CueValue::Null));
		assert!(cue.get_value("u1", "5").unwrap().is_expression());
		assert_eq!(cue.get_value("u1", "5").unwrap().evaluate(&NoVariables).unwrap(), 2.0);
		assert_eq!(cue.length, CueValue::Text(String::from("@every 5 minutes")));
		assert!(cue.track);
	}

	#[test]
	fn set_value_reports_layout_changes() {
		let mut cue = Cue::new("c", 1000).unwrap();
		assert!(cue.set_value("u1", "1", Some(CueValue::Number(5.0))));
		assert!(!cue.set_value("u1", "1", Some(CueValue::Number(6.0))));
		assert!(cue.set_value("u1", "1", None));
		assert!(cue.values.is_empty());
	}

	#[test]
	fn schedule_at_gets_prefix() {
		let mut cue = Cue::new("c", 1000).unwrap();
		cue.set_schedule_at("every day at 18:00").unwrap();
		assert_eq!(cue.schedule_at, "@every day at 18:00");
		assert!(cue.set_schedule_at("whenever").is_err());
	}
}
