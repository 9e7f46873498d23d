//! Board-wide shortcut code index.

use rustc_hash::FxHashMap;
use uuid::Uuid;

use crate::plugins::groups::cue::normalize_shortcut;

/// A cue that answers to a shortcut code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortcutTarget {
	pub group: Uuid,
	pub cue: String,
}

/// Maps normalized shortcut codes to every cue that carries them.
#[derive(Debug, Default)]
pub struct ShortcutIndex {
	codes: FxHashMap<String, Vec<ShortcutTarget>>,
}

impl ShortcutIndex {
	pub fn new() -> Self {
		return ShortcutIndex::default();
	}

	pub fn register(&mut self, code: &str, group: Uuid, cue: &str) {
		let code = normalize_shortcut(code);
		if code.is_empty() {
			return;
		}
		let targets = self.codes.entry(code).or_default();
		let target = ShortcutTarget {
			group,
			cue: String::from(cue),
		};
		if !targets.contains(&target) {
			targets.push(target);
		}
	}

	pub fn unregister(&mut self, code: &str, group: Uuid, cue: &str) {
		let code = normalize_shortcut(code);
		if let Some(targets) = self.codes.get_mut(&code) {
			targets.retain(|t| !(t.group == group && t.cue == cue));
			if targets.is_empty() {
				self.codes.remove(&code);
			}
		}
	}

	/// Drops every code pointing into `group`
	pub fn unregister_group(&mut self, group: Uuid) {
		self.codes.retain(|_, targets| {
			targets.retain(|t| t.group != group);
			return !targets.is_empty();
		});
	}

	pub fn rename_cue(&mut self, group: Uuid, old: &str, new: &str) {
		for targets in self.codes.values_mut() {
			for target in targets.iter_mut().filter(|t| t.group == group && t.cue == old) {
				target.cue = String::from(new);
			}
		}
	}

	pub fn lookup(&self, code: &str) -> Vec<ShortcutTarget> {
		return self.codes.get(&normalize_shortcut(code)).cloned().unwrap_or_default();
	}

	pub fn codes(&self) -> impl Iterator<Item = &String> {
		return self.codes.keys();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn codes_are_normalized() {
		let mut index = ShortcutIndex::new();
		let g = Uuid::new_v4();
		index.register("5.50", g, "a");
		index.register("5.5", g, "a");
		assert_eq!(index.lookup("5.5").len(), 1);
		assert_eq!(index.lookup("5.500")[0].cue, "a");
		index.register("", g, "b");
		assert_eq!(index.codes().count(), 1);
	}

	#[test]
	fn rename_and_unregister() {
		let mut index = ShortcutIndex::new();
		let (g1, g2) = (Uuid::new_v4(), Uuid::new_v4());
		index.register("go", g1, "a");
		index.register("go", g2, "b");
		index.rename_cue(g1, "a", "c");
		assert_eq!(
			index.lookup("go"),
			vec![
				ShortcutTarget {
					group: g1,
					cue: String::from("c")
				},
				ShortcutTarget {
					group: g2,
					cue: String::from("b")
				},
			]
		);
		index.unregister("go", g1, "c");
		assert_eq!(index.lookup("go").len(), 1);
		index.unregister_group(g2);
		assert!(index.lookup("go").is_empty());
		assert_eq!(index.codes().count(), 0);
	}
}
