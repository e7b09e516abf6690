//! Behavioral instruction text for the remote agent
//!
//! The text is opaque to the session; it only carries the kitchen's numbers
//! (projected meal volume and product mix) into the conversation.

use serde::{Deserialize, Serialize};

/// Question the agent must open every conversation with
pub const OPENING_QUESTION: &str = "What are we prepping for?";

/// Marker the agent puts in front of model-generated suggestions
pub const SUGGESTION_LABEL: &str = "[AI SUGGESTION]";

/// Share of sales for one menu item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MenuMix {
    pub name: String,
    /// Fraction of total meals, 0.0 to 1.0
    pub product_mix: f64,
}

/// Numbers supplied by the prep planner
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrepContext {
    /// Projected meals for the service being prepped
    pub target_volume: u32,
    #[serde(default)]
    pub menu: Vec<MenuMix>,
    /// Free-form text appended verbatim
    #[serde(default)]
    pub extra: Option<String>,
}

/// Format a mix fraction as a whole or one-decimal percentage
fn percent(mix: f64) -> String {
    let pct = (mix * 1000.0).round() / 10.0;
    if pct.fract().abs() < f64::EPSILON {
        format!("{pct:.0}%")
    } else {
        format!("{pct:.1}%")
    }
}

/// Build the instruction text sent in the session setup
#[must_use]
pub fn build_instructions(ctx: &PrepContext) -> String {
    let mut sections = Vec::new();

    sections.push(
        "You are a prep list advisor working alongside a kitchen team, acting as a sous-chef \
         who plans what to prep before service."
            .to_string(),
    );

    sections.push(format!(
        "Always open the conversation by asking: \"{OPENING_QUESTION}\""
    ));

    let mix = if ctx.menu.is_empty() {
        "No product mix is available; ask the team for their top sellers.".to_string()
    } else {
        let items: Vec<String> = ctx
            .menu
            .iter()
            .map(|m| format!("{} {}", m.name, percent(m.product_mix)))
            .collect();
        format!("Product mix: {}.", items.join(", "))
    };
    sections.push(format!(
        "{mix} Total forecast: {} meals.",
        ctx.target_volume
    ));

    sections.push(format!(
        "Quantities computed from the forecast and product mix are deterministic rules; state \
         them plainly. Anything you infer beyond those rules is a suggestion and must start with \
         {SUGGESTION_LABEL}, for example: \"{SUGGESTION_LABEL} Chicken bowls are trending up, \
         consider raising the par by 2 kg.\""
    ));

    if let Some(extra) = ctx.extra.as_deref().map(str::trim).filter(|e| !e.is_empty()) {
        sections.push(extra.to_string());
    }

    sections.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> PrepContext {
        PrepContext {
            target_volume: 240,
            menu: vec![
                MenuMix {
                    name: "Chicken Bowl".to_string(),
                    product_mix: 0.35,
                },
                MenuMix {
                    name: "Falafel Wrap".to_string(),
                    product_mix: 0.125,
                },
            ],
            extra: None,
        }
    }

    #[test]
    fn test_includes_opening_question() {
        let text = build_instructions(&context());
        assert!(text.contains(OPENING_QUESTION));
    }

    #[test]
    fn test_includes_mix_and_volume() {
        let text = build_instructions(&context());
        assert!(text.contains("Chicken Bowl 35%"));
        assert!(text.contains("Falafel Wrap 12.5%"));
        assert!(text.contains("240 meals"));
    }

    #[test]
    fn test_labels_suggestions() {
        let text = build_instructions(&context());
        assert!(text.contains(SUGGESTION_LABEL));
        assert!(text.contains("deterministic"));
    }

    #[test]
    fn test_empty_menu() {
        let text = build_instructions(&PrepContext::default());
        assert!(text.contains("No product mix"));
        assert!(text.contains("0 meals"));
    }

    #[test]
    fn test_extra_appended_when_present() {
        let mut ctx = context();
        ctx.extra = Some("  Brunch service runs until 3pm.  ".to_string());
        let text = build_instructions(&ctx);
        assert!(text.ends_with("Brunch service runs until 3pm."));

        ctx.extra = Some("   ".to_string());
        let text = build_instructions(&ctx);
        assert!(text.ends_with("2 kg.\""));
    }

    #[test]
    fn test_percent_formatting() {
        assert_eq!(percent(0.2), "20%");
        assert_eq!(percent(0.333), "33.3%");
        assert_eq!(percent(1.0), "100%");
    }
}
