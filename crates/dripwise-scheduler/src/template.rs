//! `{var.path}` template rendering for nurture steps.

use std::sync::LazyLock;

use dripwise_core::error::Result;
use dripwise_core::traits::TemplateRenderer;
use dripwise_core::types::Contact;
use regex::{Captures, Regex};
use serde_json::{Value, json};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*)\}").expect("valid placeholder regex")
});

/// Substitutes `{a.b.c}` with the matching leaf of the variable tree.
/// Placeholders that resolve to nothing, or to an object/array, are left as written.
#[derive(Debug, Default, Clone, Copy)]
pub struct BraceTemplateRenderer;

fn lookup<'a>(variables: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(variables, |node, segment| node.get(segment))
}

impl TemplateRenderer for BraceTemplateRenderer {
    fn render(&self, template: &str, variables: &Value) -> Result<String> {
        let rendered = PLACEHOLDER.replace_all(template, |caps: &Captures| {
            match lookup(variables, &caps[1]) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                Some(Value::Bool(b)) => b.to_string(),
                Some(Value::Null) => String::new(),
                _ => caps[0].to_string(),
            }
        });
        Ok(rendered.into_owned())
    }
}

/// Variables available to nurture step templates.
pub fn template_variables(contact: &Contact, business_name: &str) -> Value {
    json!({
        "contact": {
            "id": contact.id,
            "name": contact.name,
            "firstName": contact.first_name(),
            "email": contact.email,
            "phone": contact.phone,
        },
        "business": {
            "name": business_name,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact() -> Contact {
        Contact {
            id: "k1".into(),
            owner_id: "o1".into(),
            name: "Mai Tran".into(),
            email: None,
            phone: Some("+15550100".into()),
        }
    }

    #[test]
    fn test_render_known_variables() {
        let vars = template_variables(&contact(), "Glow Spa");
        let out = BraceTemplateRenderer
            .render("Hi {contact.firstName}, {business.name} misses you!", &vars)
            .unwrap();
        assert_eq!(out, "Hi Mai, Glow Spa misses you!");
    }

    #[test]
    fn test_unknown_passes_through() {
        let vars = template_variables(&contact(), "Glow Spa");
        let out = BraceTemplateRenderer
            .render("{contact.nickname} {coupon} {contact}", &vars)
            .unwrap();
        assert_eq!(out, "{contact.nickname} {coupon} {contact}");
    }

    #[test]
    fn test_null_renders_empty() {
        let vars = template_variables(&contact(), "Glow Spa");
        let out = BraceTemplateRenderer.render("[{contact.email}]", &vars).unwrap();
        assert_eq!(out, "[]");
    }

    #[test]
    fn test_non_placeholder_braces_untouched() {
        let vars = json!({"n": 3});
        let out = BraceTemplateRenderer.render("{ not a var } {n}", &vars).unwrap();
        assert_eq!(out, "{ not a var } 3");
    }
}
