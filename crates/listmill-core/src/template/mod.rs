//! Campaign message personalization
//!
//! Campaign bodies and subjects are personalized per subscriber with a
//! small placeholder language: `{{name}}`, `{{email}}`, `{{uuid}}`,
//! `{{attributes.<key>}}`, `{{unsubscribe_url}}` and `{{track_view}}`.
//! Unresolved placeholders are stripped from the output. Visual-editor
//! campaigns, whose bodies carry no placeholders at all, get the tracking
//! pixel injected after rendering.

use listmill_common::types::ContentType;
use listmill_common::Error;
use listmill_storage::models::{Campaign, Subscriber};
use regex::Regex;
use serde_json::Value;
use uuid::Uuid;

/// A campaign body compiled for per-subscriber rendering
pub struct CampaignTemplate {
    body: String,
    subject: String,
    content_type: ContentType,
    campaign_uuid: Uuid,
    root_url: String,
    /// Visual bodies without the tracking helper get the pixel appended
    inject_pixel: bool,
    strip_re: Regex,
}

/// A rendered message for one subscriber
#[derive(Debug, Clone)]
pub struct Rendered {
    pub subject: String,
    pub body: String,
}

impl CampaignTemplate {
    /// Compile a campaign's body and subject.
    pub fn compile(campaign: &Campaign, root_url: &str) -> Result<Self, Error> {
        let content_type = campaign.content_type();
        let inject_pixel =
            content_type == ContentType::Visual && !campaign.body.contains("{{track_view}}");

        let strip_re = Regex::new(r"\{\{[^}]+\}\}")
            .map_err(|e| Error::Template(format!("Placeholder pattern: {}", e)))?;

        Ok(Self {
            body: campaign.body.clone(),
            subject: campaign.subject.clone(),
            content_type,
            campaign_uuid: campaign.uuid,
            root_url: root_url.trim_end_matches('/').to_string(),
            inject_pixel,
            strip_re,
        })
    }

    /// Render the body and subject for one subscriber.
    pub fn render(&self, subscriber: &Subscriber) -> Result<Rendered, Error> {
        if subscriber.email.trim().is_empty() {
            return Err(Error::Template(format!(
                "Subscriber {} has no email address",
                subscriber.id
            )));
        }

        let mut body = self.substitute(&self.body, subscriber);
        if self.inject_pixel {
            body = inject_before_body_close(&body, &self.pixel_tag(subscriber));
        }
        let body = self.strip_re.replace_all(&body, "").to_string();

        let subject = self.substitute(&self.subject, subscriber);
        let subject = self.strip_re.replace_all(&subject, "").to_string();

        Ok(Rendered { subject, body })
    }

    /// Unsubscribe link for one subscriber
    pub fn unsubscribe_url(&self, subscriber: &Subscriber) -> String {
        format!(
            "{}/subscription/{}/{}",
            self.root_url, self.campaign_uuid, subscriber.uuid
        )
    }

    fn pixel_url(&self, subscriber: &Subscriber) -> String {
        format!(
            "{}/campaign/{}/{}/px.png",
            self.root_url, self.campaign_uuid, subscriber.uuid
        )
    }

    fn pixel_tag(&self, subscriber: &Subscriber) -> String {
        format!(
            "<img src=\"{}\" alt=\"\" width=\"1\" height=\"1\" />",
            self.pixel_url(subscriber)
        )
    }

    fn substitute(&self, template: &str, subscriber: &Subscriber) -> String {
        let mut result = template.to_string();

        result = result.replace("{{name}}", &subscriber.name);
        result = result.replace("{{email}}", &subscriber.email);
        result = result.replace("{{uuid}}", &subscriber.uuid.to_string());
        result = result.replace("{{unsubscribe_url}}", &self.unsubscribe_url(subscriber));
        result = result.replace("{{track_view}}", &self.pixel_tag(subscriber));

        if let Some(attrs) = subscriber.attribs.as_object() {
            for (key, value) in attrs {
                let placeholder = format!("{{{{attributes.{}}}}}", key);
                let value_str = match value {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    _ => value.to_string(),
                };
                result = result.replace(&placeholder, &value_str);
            }
        }

        result
    }
}

/// Insert `fragment` just before `</body>`, or append when the document
/// has no body close tag.
fn inject_before_body_close(html: &str, fragment: &str) -> String {
    let lower = html.to_lowercase();
    match lower.rfind("</body>") {
        Some(idx) => {
            let mut out = String::with_capacity(html.len() + fragment.len());
            out.push_str(&html[..idx]);
            out.push_str(fragment);
            out.push_str(&html[idx..]);
            out
        }
        None => {
            let mut out = html.to_string();
            out.push_str(fragment);
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use chrono::Utc;

    fn test_campaign(body: &str, content_type: &str) -> Campaign {
        Campaign {
            id: 1,
            uuid: Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap(),
            name: "welcome".to_string(),
            subject: "Hi {{name}}".to_string(),
            from_email: None,
            body: body.to_string(),
            content_type: content_type.to_string(),
            messenger: "email".to_string(),
            status: "running".to_string(),
            daily_quota: None,
            send_interval: None,
            to_send: 0,
            sent: 0,
            last_subscriber_id: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn test_subscriber() -> Subscriber {
        Subscriber {
            id: 7,
            uuid: Uuid::parse_str("6ba7b810-9dad-41d1-80b4-00c04fd430c8").unwrap(),
            email: "john@example.com".to_string(),
            name: "John Doe".to_string(),
            attribs: serde_json::json!({"company": "Acme Corp", "seats": 5}),
            status: "enabled".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_render_basic_placeholders() {
        let tpl = CampaignTemplate::compile(
            &test_campaign("Hello {{name}}, your email is {{email}}", "richtext"),
            "https://news.example.com",
        )
        .unwrap();

        let rendered = tpl.render(&test_subscriber()).unwrap();
        assert_eq!(rendered.body, "Hello John Doe, your email is john@example.com");
        assert_eq!(rendered.subject, "Hi John Doe");
    }

    #[test]
    fn test_render_attributes_and_strips_unknown() {
        let tpl = CampaignTemplate::compile(
            &test_campaign("{{attributes.company}} has {{attributes.seats}} seats {{nope}}", "richtext"),
            "https://news.example.com",
        )
        .unwrap();

        let rendered = tpl.render(&test_subscriber()).unwrap();
        assert_eq!(rendered.body, "Acme Corp has 5 seats ");
    }

    #[test]
    fn test_unsubscribe_url() {
        let tpl = CampaignTemplate::compile(
            &test_campaign("{{unsubscribe_url}}", "richtext"),
            "https://news.example.com/",
        )
        .unwrap();

        let rendered = tpl.render(&test_subscriber()).unwrap();
        assert_eq!(
            rendered.body,
            "https://news.example.com/subscription/550e8400-e29b-41d4-a716-446655440000/6ba7b810-9dad-41d1-80b4-00c04fd430c8"
        );
    }

    #[test]
    fn test_visual_body_gets_pixel_before_body_close() {
        let tpl = CampaignTemplate::compile(
            &test_campaign("<html><body><p>Hi</p></body></html>", "visual"),
            "https://news.example.com",
        )
        .unwrap();

        let rendered = tpl.render(&test_subscriber()).unwrap();
        let pixel_at = rendered.body.find("/px.png").unwrap();
        let close_at = rendered.body.find("</body>").unwrap();
        assert!(pixel_at < close_at);
    }

    #[test]
    fn test_visual_body_without_body_tag_appends_pixel() {
        let tpl = CampaignTemplate::compile(
            &test_campaign("<p>Hi</p>", "visual"),
            "https://news.example.com",
        )
        .unwrap();

        let rendered = tpl.render(&test_subscriber()).unwrap();
        assert!(rendered.body.starts_with("<p>Hi</p><img "));
    }

    #[test]
    fn test_explicit_track_view_helper_is_not_doubled() {
        let tpl = CampaignTemplate::compile(
            &test_campaign("<body>{{track_view}}</body>", "visual"),
            "https://news.example.com",
        )
        .unwrap();

        let rendered = tpl.render(&test_subscriber()).unwrap();
        assert_eq!(rendered.body.matches("/px.png").count(), 1);
    }

    #[test]
    fn test_render_fails_without_email() {
        let tpl = CampaignTemplate::compile(
            &test_campaign("Hello", "richtext"),
            "https://news.example.com",
        )
        .unwrap();

        let mut sub = test_subscriber();
        sub.email = String::new();
        assert!(tpl.render(&sub).is_err());
    }
}
