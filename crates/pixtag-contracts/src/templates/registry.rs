/// Turn markers for one conversational format.
///
/// Templates are plain data: selection is a lookup over `names`, never
/// behavior dispatch. `system` may be empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    pub names: Vec<String>,
    pub user: String,
    pub assistant: String,
    pub system: String,
}

impl PromptTemplate {
    pub fn new(names: &[&str], user: &str, assistant: &str, system: &str) -> Self {
        Self {
            names: names.iter().map(|name| (*name).to_string()).collect(),
            user: user.to_string(),
            assistant: assistant.to_string(),
            system: system.to_string(),
        }
    }

    /// First declared alias, used for display.
    pub fn label(&self) -> &str {
        self.names.first().map(String::as_str).unwrap_or("")
    }

    /// Wraps instruction and content in this template's user/assistant turns.
    pub fn wrap(&self, instruction: &str, content: &str) -> String {
        format!("{}{instruction}{content}{}", self.user, self.assistant)
    }
}

#[derive(Debug, Clone)]
pub struct TemplateRegistry {
    templates: Vec<PromptTemplate>,
}

impl TemplateRegistry {
    /// The first template of `templates` doubles as the fallback.
    pub fn new(templates: Option<Vec<PromptTemplate>>) -> Self {
        let templates = templates
            .filter(|rows| !rows.is_empty())
            .unwrap_or_else(default_templates);
        Self { templates }
    }

    pub fn list(&self) -> impl Iterator<Item = &PromptTemplate> {
        self.templates.iter()
    }

    pub fn get(&self, name: &str) -> Option<&PromptTemplate> {
        self.templates
            .iter()
            .find(|template| template.names.iter().any(|alias| alias == name))
    }

    pub fn fallback(&self) -> &PromptTemplate {
        &self.templates[0]
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

fn default_templates() -> Vec<PromptTemplate> {
    vec![
        PromptTemplate::new(
            &["Alpaca"],
            "\n\n### Instruction:\n\n",
            "\n\n### Response:\n\n",
            "",
        ),
        PromptTemplate::new(
            &["Vicuna", "Wizard", "ShareGPT", "Qwen"],
            "### Human: ",
            "\n### Assistant: ",
            "",
        ),
        PromptTemplate::new(&["Llama 2", "Llama2", "Llamav2"], "[INST] ", " [/INST]", ""),
        PromptTemplate::new(
            &["Llama 3", "Llama3", "Llama-3"],
            "<|eot_id|><|start_header_id|>user<|end_header_id|>\n\n",
            "<|eot_id|><|start_header_id|>assistant<|end_header_id|>\n\n",
            "",
        ),
        PromptTemplate::new(
            &["Phi-3"],
            "<|end|><|user|>\n",
            "<end_of_turn><|end|><|assistant|>\n",
            "",
        ),
        PromptTemplate::new(&["Mistral", "bakllava"], "\n[INST] ", " [/INST]\n", ""),
        PromptTemplate::new(&["Yi"], "<|user|>", "<|assistant|>", ""),
        PromptTemplate::new(
            &["ChatML", "obsidian", "Nous", "Hermes", "llava-v1.6-34b"],
            "<|im_start|>user\n",
            "<|im_end|>\n<|im_start|>assistant\n",
            "",
        ),
        PromptTemplate::new(&["WizardLM"], "input:\n", "output\n", ""),
    ]
}

#[cfg(test)]
mod tests {
    use super::{PromptTemplate, TemplateRegistry};

    #[test]
    fn default_registry_falls_back_to_alpaca() {
        let registry = TemplateRegistry::default();
        assert_eq!(registry.fallback().label(), "Alpaca");
        assert!(registry.get("ChatML").is_some());
        assert!(registry.get("chatml").is_none());
    }

    #[test]
    fn empty_template_list_uses_defaults() {
        let registry = TemplateRegistry::new(Some(Vec::new()));
        assert_eq!(registry.list().count(), 9);
    }

    #[test]
    fn wrap_concatenates_turn_markers() {
        let template = PromptTemplate::new(&["Test"], "<u>", "<a>", "");
        assert_eq!(template.wrap("Describe. ", "body"), "<u>Describe. body<a>");
    }
}
