use super::registry::{PromptTemplate, TemplateRegistry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateSelection {
    pub template: PromptTemplate,
    pub model: Option<String>,
    pub matched_alias: Option<String>,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TemplateSelector {
    pub registry: TemplateRegistry,
}

impl TemplateSelector {
    pub fn new(registry: Option<TemplateRegistry>) -> Self {
        Self {
            registry: registry.unwrap_or_default(),
        }
    }

    /// Picks the template whose matching alias is the longest substring of
    /// the normalized model name. Ties keep the first declared template.
    pub fn select(&self, model: Option<&str>) -> TemplateSelection {
        let Some(model_name) = model.map(str::trim).filter(|value| !value.is_empty()) else {
            return self.fallback(None, "Model name unavailable; using default template.");
        };

        let normalized = normalize_model_name(model_name);
        let mut best: Option<(&PromptTemplate, &str, usize)> = None;
        for template in self.registry.list() {
            for alias in &template.names {
                let alias_key = normalize_model_name(alias);
                if alias_key.is_empty() || !normalized.contains(&alias_key) {
                    continue;
                }
                let longer = best
                    .map(|(_, _, len)| alias_key.len() > len)
                    .unwrap_or(true);
                if longer {
                    best = Some((template, alias.as_str(), alias_key.len()));
                }
            }
        }

        match best {
            Some((template, alias, _)) => TemplateSelection {
                template: template.clone(),
                model: Some(model_name.to_string()),
                matched_alias: Some(alias.to_string()),
                fallback_reason: None,
            },
            None => self.fallback(
                Some(model_name),
                &format!("No template matches model '{model_name}'; using default template."),
            ),
        }
    }

    fn fallback(&self, model: Option<&str>, reason: &str) -> TemplateSelection {
        TemplateSelection {
            template: self.registry.fallback().clone(),
            model: model.map(str::to_string),
            matched_alias: None,
            fallback_reason: Some(reason.to_string()),
        }
    }
}

/// Lowercases and drops everything that is not an ASCII letter or digit.
pub fn normalize_model_name(raw: &str) -> String {
    raw.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|ch| ch.to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use crate::templates::{PromptTemplate, TemplateRegistry};

    use super::{normalize_model_name, TemplateSelector};

    fn selector(templates: Vec<PromptTemplate>) -> TemplateSelector {
        TemplateSelector::new(Some(TemplateRegistry::new(Some(templates))))
    }

    #[test]
    fn normalization_ignores_case_and_punctuation() {
        assert_eq!(normalize_model_name("Llama-3 8B_Instruct!"), "llama38binstruct");
        assert_eq!(normalize_model_name("  "), "");
    }

    #[test]
    fn longest_alias_wins_over_family_prefix() {
        let selection = selector(vec![
            PromptTemplate::new(&["Default"], "u", "a", ""),
            PromptTemplate::new(&["Llama"], "[L]", "[/L]", ""),
            PromptTemplate::new(&["Llama 3"], "[L3]", "[/L3]", ""),
        ])
        .select(Some("Llama-3-8B-Instruct"));
        assert_eq!(selection.template.label(), "Llama 3");
        assert_eq!(selection.matched_alias.as_deref(), Some("Llama 3"));
        assert!(selection.fallback_reason.is_none());
    }

    #[test]
    fn equal_length_aliases_keep_first_declared() {
        let selection = selector(vec![
            PromptTemplate::new(&["Default"], "u", "a", ""),
            PromptTemplate::new(&["abc"], "first", "", ""),
            PromptTemplate::new(&["bcd"], "second", "", ""),
        ])
        .select(Some("model-abcd"));
        assert_eq!(selection.template.user, "first");
    }

    #[test]
    fn default_templates_resolve_common_model_names() {
        let selector = TemplateSelector::default();
        let cases = [
            ("koboldcpp/Meta-Llama-3-8B-Instruct.Q4_K_M", "Llama 3"),
            ("llama-2-13b-chat", "Llama 2"),
            ("WizardLM-13B-V1.2", "WizardLM"),
            ("koboldcpp/mistral-7b-instruct-v0.2", "Mistral"),
            ("Nous-Hermes-2-Mixtral", "ChatML"),
        ];
        for (model, expected) in cases {
            assert_eq!(
                selector.select(Some(model)).template.label(),
                expected,
                "model {model}"
            );
        }
    }

    #[test]
    fn unmatched_or_missing_model_falls_back() {
        let selector = TemplateSelector::default();
        let unmatched = selector.select(Some("gpt-zzz"));
        assert_eq!(unmatched.template.label(), "Alpaca");
        assert_eq!(
            unmatched.fallback_reason.as_deref(),
            Some("No template matches model 'gpt-zzz'; using default template.")
        );

        let missing = selector.select(None);
        assert_eq!(missing.template.label(), "Alpaca");
        assert!(missing.model.is_none());
    }

    #[test]
    fn selection_is_a_pure_function_of_the_name() {
        let selector = TemplateSelector::default();
        let first = selector.select(Some("Qwen2-VL-7B"));
        let second = selector.select(Some("Qwen2-VL-7B"));
        assert_eq!(first, second);
    }
}
