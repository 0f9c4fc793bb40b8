//! TOML recipes: a named, reusable list of effects.
//!
//! ```toml
//! [[effect]]
//! kind = "mark_input"
//!
//! [[effect]]
//! kind = "normalize_input_speed"
//! cpm = 420
//! ```
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::effects::EffectSpec;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    #[serde(default, rename = "effect")]
    pub effects: Vec<EffectSpec>,
}

impl Recipe {
    pub fn from_toml(text: &str) -> Result<Self> {
        let recipe: Recipe = toml::from_str(text)?;
        recipe.validate()?;
        Ok(recipe)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| Error::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let recipe = Self::from_toml(&text)?;
        info!(path = %path.display(), effects = recipe.effects.len(), "loaded recipe");
        Ok(recipe)
    }

    pub fn validate(&self) -> Result<()> {
        self.effects.iter().try_for_each(EffectSpec::validate)
    }

    pub fn push(&mut self, spec: EffectSpec) {
        self.effects.push(spec);
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_effects_with_defaults() {
        let recipe = Recipe::from_toml(
            r#"
            [[effect]]
            kind = "mark_input"

            [[effect]]
            kind = "normalize_input_speed"
            cpm = 420

            [[effect]]
            kind = "cap_delays"
            "#,
        )
        .unwrap();
        assert_eq!(
            recipe.effects,
            vec![
                EffectSpec::MarkInput {
                    prompt_suffix: " $ ".into()
                },
                EffectSpec::NormalizeInputSpeed { cpm: 420.0 },
                EffectSpec::CapDelays { max_delay: 3.0 },
            ]
        );
    }

    #[test]
    fn parses_unit_and_ramp_effects() {
        let recipe = Recipe::from_toml(
            "[[effect]]\nkind = \"remove_window_size\"\n\n[[effect]]\nkind = \"linear_input_delay\"\nduration = 120.0\n",
        )
        .unwrap();
        assert_eq!(
            recipe.effects,
            vec![
                EffectSpec::RemoveWindowSize,
                EffectSpec::LinearInputDelay {
                    start_delay: 0.1,
                    end_delay: 0.01,
                    duration: 120.0
                },
            ]
        );
    }

    #[test]
    fn empty_document_is_an_empty_recipe() {
        assert!(Recipe::from_toml("").unwrap().is_empty());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = Recipe::from_toml("[[effect]]\nkind = \"explode\"\n").unwrap_err();
        assert!(matches!(err, Error::Recipe(_)));
    }

    #[test]
    fn invalid_arguments_are_rejected() {
        let err = Recipe::from_toml("[[effect]]\nkind = \"change_speed\"\nspeed = 0.0\n").unwrap_err();
        assert!(matches!(err, Error::EffectPrecondition { effect: "change_speed", .. }));
    }

    #[test]
    fn serializes_back_to_toml() {
        let mut recipe = Recipe::default();
        recipe.push(EffectSpec::ChangeSpeed { speed: 2.0 });
        recipe.push(EffectSpec::MergeLines {
            threshold: 0.05,
            merge_input: true,
        });
        let text = toml::to_string(&recipe).unwrap();
        assert!(text.contains("kind = \"change_speed\""));
        assert_eq!(Recipe::from_toml(&text).unwrap(), recipe);
    }
}
