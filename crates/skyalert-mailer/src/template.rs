//! Template selection and rendering.
//!
//! Templates are managed externally per weather type and target role.
//! Rendering substitutes `{{field}}` tokens (including the Chinese-language
//! aliases older templates use), scrubs anything left over, and falls back
//! to generated subject/body text so an incomplete template never produces
//! an empty email.

use std::sync::LazyLock;

use regex::Regex;
use skyalert_core::types::{Candidate, Customer, MailPayload, TargetRole, Template};

static LEFTOVER_TOKENS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{.*?\}\}").expect("valid token pattern"));

/// Pick the template for a weather type and recipient category.
/// Role-specific templates and `all` templates are both acceptable;
/// declaration order breaks ties, matching the management tooling.
pub fn select_template<'a>(
    templates: &'a [Template],
    weather_type: &str,
    is_engineer: bool,
) -> Option<&'a Template> {
    templates
        .iter()
        .filter(|t| t.is_active && t.weather_type == weather_type)
        .find(|t| match t.target_role {
            TargetRole::All => true,
            TargetRole::Customer => !is_engineer,
            TargetRole::Engineer => is_engineer,
        })
}

/// Substitute `{{field}}` tokens from customer and alert data. Unknown
/// tokens are removed rather than leaking into the email.
pub fn render(
    content: &str,
    customer: &Customer,
    alert_date: &str,
    weather_type: &str,
) -> String {
    let substitutions: [(&str, &str); 14] = [
        ("{{name}}", &customer.name),
        ("{{title}}", &customer.title),
        ("{{company}}", &customer.company),
        ("{{region}}", &customer.region),
        ("{{date}}", alert_date),
        ("{{weather_type}}", weather_type),
        ("{{phone}}", &customer.phone),
        ("{{email}}", &customer.email),
        ("{{地区}}", &customer.region),
        ("{{日期}}", alert_date),
        ("{{天气类型}}", weather_type),
        ("{{公司}}", &customer.company),
        ("{{姓名}}", &customer.name),
        ("{{称呼}}", &customer.title),
    ];

    let mut rendered = content.to_string();
    for (token, value) in substitutions {
        rendered = rendered.replace(token, value);
    }
    LEFTOVER_TOKENS.replace_all(&rendered, "").into_owned()
}

/// Convert plain text to the HTML body shape the transport sends.
pub fn prepare_html(content: &str) -> String {
    let body = content
        .replace('\n', "<br>")
        .replace('\t', "&nbsp;&nbsp;&nbsp;&nbsp;");
    format!(
        "<html>\n<head><meta charset=\"UTF-8\"></head>\n<body>\n\
         <div style=\"font-family: Arial, sans-serif; line-height: 1.6;\">\n{body}\n</div>\n\
         </body>\n</html>"
    )
}

pub fn default_subject(region: &str, weather_type: &str) -> String {
    format!("{region}地区{weather_type}天气预警通知")
}

pub fn default_body(
    name: &str,
    region: &str,
    alert_date: &str,
    weather_type: &str,
    condition: &str,
) -> String {
    let condition = if condition.is_empty() { "未知条件" } else { condition };
    format!(
        "尊敬的{name}：\n\n\
         我们检测到您所在的{region}地区将在{alert_date}出现{weather_type}天气情况。\n\n\
         具体情况：{condition}\n\n\
         请注意防范，确保安全。\n\n\
         此致\n天气预警系统"
    )
}

/// Render a matched candidate into a complete outbound payload.
pub fn build_payload(candidate: &Candidate, template: &Template, is_test: bool) -> MailPayload {
    let alert_date = candidate.forecast_date.format("%Y-%m-%d").to_string();
    let customer = &candidate.customer;

    let mut content = render(
        &template.content,
        customer,
        &alert_date,
        &candidate.weather_type,
    );
    if content.trim().is_empty() {
        tracing::warn!(
            "template content empty for {} / {}, using default body",
            candidate.weather_type,
            customer.name
        );
        content = default_body(
            &customer.name,
            &candidate.region,
            &alert_date,
            &candidate.weather_type,
            &candidate.condition,
        );
    }

    let subject = if template.subject.trim().is_empty() {
        default_subject(&candidate.region, &candidate.weather_type)
    } else {
        template.subject.clone()
    };

    MailPayload {
        to_email: customer.email.clone(),
        to_name: customer.name.clone(),
        subject,
        content,
        company: customer.company.clone(),
        region: candidate.region.clone(),
        weather_type: candidate.weather_type.clone(),
        alert_date,
        condition: candidate.condition.clone(),
        category: customer.category.clone(),
        attachments: template.attachments.clone(),
        is_test,
    }
}
