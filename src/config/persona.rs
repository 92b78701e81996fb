use serde::{ Deserialize, Serialize };
use std::fs;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use log::info;

const DEFAULT_MODEL: &str = "mistral-small-latest";

const DEFAULT_INSTRUCTIONS: &str = "You are the Temporal Concierge for Chronos Voyages, the world's premier luxury time travel agency. You speak with elegance, sophistication, and a touch of mystery.

Your role is to:
- Help clients choose their ideal time travel destination
- Answer questions about our three featured destinations: Paris 1889 (Belle Epoque, Eiffel Tower unveiling), the Cretaceous Era (prehistoric wilderness expedition), and Florence 1504 (Renaissance art and culture with Leonardo da Vinci)
- Discuss safety protocols, packing, and travel preparation
- Maintain an air of luxury and exclusivity
- Be knowledgeable about history while keeping the fantasy of time travel alive
- Keep responses concise (2-4 sentences) unless the client asks for more detail";

const DEFAULT_CLOSING: &str = "Always maintain the fiction that time travel is real and that Chronos Voyages is the most trusted agency in temporal tourism.";

#[derive(Debug, Error)]
pub enum PersonaError {
    #[error("Persona file IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Persona JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid persona: {0}")]
    Invalid(String),
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Destination {
    pub name: String,
    pub price_credits: u32,
    /// Shown in parentheses after the price, e.g. "our most adventurous package".
    #[serde(default)]
    pub note: Option<String>,
}

/// Fixed persona and catalog facts attached to every relayed conversation.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Persona {
    pub name: String,
    pub model: String,
    pub instructions: String,
    #[serde(default)]
    pub destinations: Vec<Destination>,
    #[serde(default)]
    pub closing: Option<String>,
}

impl Default for Persona {
    fn default() -> Self {
        Self {
            name: "Temporal Concierge".to_string(),
            model: DEFAULT_MODEL.to_string(),
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
            destinations: vec![
                Destination {
                    name: "Paris 1889".to_string(),
                    price_credits: 45_000,
                    note: None,
                },
                Destination {
                    name: "Cretaceous Era".to_string(),
                    price_credits: 89_000,
                    note: Some("our most adventurous package".to_string()),
                },
                Destination {
                    name: "Florence 1504".to_string(),
                    price_credits: 62_000,
                    note: None,
                }
            ],
            closing: Some(DEFAULT_CLOSING.to_string()),
        }
    }
}

impl Persona {
    fn validate(&self) -> Result<(), PersonaError> {
        if self.name.trim().is_empty() {
            return Err(PersonaError::Invalid("name must not be empty".to_string()));
        }
        if self.model.trim().is_empty() {
            return Err(PersonaError::Invalid("model must not be empty".to_string()));
        }
        if self.instructions.trim().is_empty() {
            return Err(PersonaError::Invalid("instructions must not be empty".to_string()));
        }
        for (idx, destination) in self.destinations.iter().enumerate() {
            if destination.name.trim().is_empty() {
                return Err(PersonaError::Invalid(format!("destination #{} has no name", idx)));
            }
            if self.destinations[..idx].iter().any(|d| d.name == destination.name) {
                return Err(
                    PersonaError::Invalid(format!("duplicate destination '{}'", destination.name))
                );
            }
        }
        Ok(())
    }

    /// The system instruction sent ahead of every conversation.
    pub fn system_prompt(&self) -> String {
        let mut prompt = self.instructions.trim_end().to_string();

        if !self.destinations.is_empty() {
            prompt.push_str("\n\nPricing:");
            for destination in &self.destinations {
                prompt.push_str(
                    &format!(
                        "\n- {}: Starting from {} credits per person",
                        destination.name,
                        format_credits(destination.price_credits)
                    )
                );
                if let Some(note) = &destination.note {
                    prompt.push_str(&format!(" ({})", note));
                }
            }
        }

        if let Some(closing) = self.closing.as_deref().filter(|c| !c.trim().is_empty()) {
            prompt.push_str("\n\n");
            prompt.push_str(closing.trim());
        }
        prompt
    }
}

fn format_credits(amount: u32) -> String {
    let digits = amount.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (idx, ch) in digits.chars().enumerate() {
        if idx > 0 && (digits.len() - idx) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

pub fn load_persona<P: AsRef<Path>>(path: P) -> Result<Persona, PersonaError> {
    let file_content = fs::read_to_string(path.as_ref())?;
    let persona: Persona = serde_json::from_str(&file_content)?;
    persona.validate()?;
    info!("Loaded persona '{}' from {}", persona.name, path.as_ref().display());
    Ok(persona)
}

/// Resolves the persona once at startup; it is shared read-only afterwards.
pub fn resolve_persona(path: Option<&str>) -> Result<Arc<Persona>, PersonaError> {
    match path.filter(|p| !p.trim().is_empty()) {
        Some(path) => Ok(Arc::new(load_persona(path)?)),
        None => {
            let persona = Persona::default();
            info!("Using built-in persona '{}'", persona.name);
            Ok(Arc::new(persona))
        }
    }
}
