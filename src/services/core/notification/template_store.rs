// Versioned notification templates with variable substitution.

use crate::types::{Channel, Priority, TemplateCategory};
use crate::utils::{logger::Logger, LogLevel, NotifyError, NotifyResult};
use crate::types::{Page, PageRequest};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;
use tokio::sync::RwLock;

/// A single version of a named template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub template_id: String,
    /// Unique across active versions; versions share this name.
    pub template_name: String,
    pub display_name: String,
    pub description: Option<String>,
    pub channel: Channel,
    pub category: TemplateCategory,
    pub subject_template: String,
    pub content_template: String,
    pub html_template: Option<String>,
    pub active: bool,
    pub version: u32,
    pub default_priority: Priority,
    pub rate_limit_per_hour: Option<u32>,
    pub created_by: String,
    pub updated_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub usage_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub deleted: bool,
}

/// Input for creating the first version of a template.
#[derive(Debug, Clone)]
pub struct NewTemplate {
    pub template_name: String,
    pub display_name: String,
    pub description: Option<String>,
    pub channel: Channel,
    pub category: TemplateCategory,
    pub subject_template: String,
    pub content_template: String,
    pub html_template: Option<String>,
    pub default_priority: Priority,
    pub rate_limit_per_hour: Option<u32>,
    pub created_by: String,
}

/// Field-scoped in-place update of the current version.
#[derive(Debug, Clone, Default)]
pub struct TemplateUpdate {
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub subject_template: Option<String>,
    pub content_template: Option<String>,
    pub html_template: Option<Option<String>>,
    pub default_priority: Option<Priority>,
    pub rate_limit_per_hour: Option<Option<u32>>,
    pub updated_by: String,
}

/// Search filters for the template catalog.
#[derive(Debug, Clone, Default)]
pub struct TemplateFilters {
    pub name_contains: Option<String>,
    pub category: Option<TemplateCategory>,
    pub channel: Option<Channel>,
    pub active_only: bool,
}

/// Output of rendering a template (or inline content) for one dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedMessage {
    pub subject: Option<String>,
    pub content: String,
    pub html: Option<String>,
}

/// Configuration for the template store.
#[derive(Debug, Clone)]
pub struct TemplateStoreConfig {
    pub enable_render_cache: bool,
    pub render_cache_ttl_seconds: i64,
    pub max_subject_length: usize,
    pub max_content_length: usize,
}

impl Default for TemplateStoreConfig {
    fn default() -> Self {
        Self {
            enable_render_cache: true,
            render_cache_ttl_seconds: 3600,
            max_subject_length: 500,
            max_content_length: 65_536,
        }
    }
}

impl TemplateStoreConfig {
    pub fn validate(&self) -> NotifyResult<()> {
        if self.render_cache_ttl_seconds <= 0 {
            return Err(NotifyError::config_error(
                "render_cache_ttl_seconds must be greater than 0",
            ));
        }
        if self.max_subject_length == 0 || self.max_content_length == 0 {
            return Err(NotifyError::config_error(
                "template size limits must be greater than 0",
            ));
        }
        Ok(())
    }
}

static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();

fn placeholder_regex() -> &'static Regex {
    PLACEHOLDER.get_or_init(|| Regex::new(r"\{\{([A-Za-z0-9_.]+)\}\}").unwrap())
}

/// Read-mostly template catalog. All versions live in one map keyed by
/// template id; the invariant "exactly one active version per name" is
/// maintained by the write paths under the write lock.
pub struct TemplateStore {
    config: TemplateStoreConfig,
    templates: RwLock<HashMap<String, Template>>,
    render_cache: RwLock<HashMap<String, (RenderedMessage, i64)>>,
    logger: Logger,
}

impl TemplateStore {
    pub fn new(config: TemplateStoreConfig) -> NotifyResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            templates: RwLock::new(HashMap::new()),
            render_cache: RwLock::new(HashMap::new()),
            logger: Logger::new(LogLevel::Info),
        })
    }

    // ============= LOOKUPS =============

    /// The active, non-deleted version of a name.
    pub async fn get_by_name(&self, name: &str) -> Option<Template> {
        let templates = self.templates.read().await;
        templates
            .values()
            .find(|t| t.template_name == name && t.active && !t.deleted)
            .cloned()
    }

    /// The highest version of a name regardless of active flag.
    pub async fn get_latest_version(&self, name: &str) -> Option<Template> {
        let templates = self.templates.read().await;
        templates
            .values()
            .filter(|t| t.template_name == name && !t.deleted)
            .max_by_key(|t| t.version)
            .cloned()
    }

    pub async fn get(&self, template_id: &str) -> NotifyResult<Template> {
        let templates = self.templates.read().await;
        templates
            .get(template_id)
            .filter(|t| !t.deleted)
            .cloned()
            .ok_or_else(|| NotifyError::not_found(format!("Template not found: {}", template_id)))
    }

    pub async fn list_by_category(&self, category: &TemplateCategory) -> Vec<Template> {
        let templates = self.templates.read().await;
        let mut result: Vec<Template> = templates
            .values()
            .filter(|t| &t.category == category && t.active && !t.deleted)
            .cloned()
            .collect();
        result.sort_by(|a, b| a.template_name.cmp(&b.template_name));
        result
    }

    pub async fn list_by_type(&self, channel: Channel) -> Vec<Template> {
        let templates = self.templates.read().await;
        let mut result: Vec<Template> = templates
            .values()
            .filter(|t| t.channel == channel && t.active && !t.deleted)
            .cloned()
            .collect();
        result.sort_by(|a, b| a.template_name.cmp(&b.template_name));
        result
    }

    pub async fn search(&self, filters: TemplateFilters, page: PageRequest) -> Page<Template> {
        let templates = self.templates.read().await;
        let mut matched: Vec<Template> = templates
            .values()
            .filter(|t| !t.deleted)
            .filter(|t| !filters.active_only || t.active)
            .filter(|t| {
                filters
                    .name_contains
                    .as_deref()
                    .map(|needle| t.template_name.contains(needle))
                    .unwrap_or(true)
            })
            .filter(|t| {
                filters
                    .category
                    .as_ref()
                    .map(|cat| &t.category == cat)
                    .unwrap_or(true)
            })
            .filter(|t| filters.channel.map(|ch| t.channel == ch).unwrap_or(true))
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            a.template_name
                .cmp(&b.template_name)
                .then(b.version.cmp(&a.version))
        });
        Page::from_slice(matched, page)
    }

    // ============= MUTATIONS =============

    pub async fn create_template(&self, input: NewTemplate) -> NotifyResult<Template> {
        self.validate_content(&input.subject_template, &input.content_template)?;
        if input.template_name.trim().is_empty() {
            return Err(NotifyError::validation_error("Template name cannot be empty"));
        }

        let mut templates = self.templates.write().await;
        let exists = templates
            .values()
            .any(|t| t.template_name == input.template_name && !t.deleted);
        if exists {
            return Err(NotifyError::already_exists(format!(
                "Template already exists: {}",
                input.template_name
            )));
        }

        let now = Utc::now();
        let template = Template {
            template_id: uuid::Uuid::new_v4().to_string(),
            template_name: input.template_name,
            display_name: input.display_name,
            description: input.description,
            channel: input.channel,
            category: input.category,
            subject_template: input.subject_template,
            content_template: input.content_template,
            html_template: input.html_template,
            active: true,
            version: 1,
            default_priority: input.default_priority,
            rate_limit_per_hour: input.rate_limit_per_hour,
            created_by: input.created_by.clone(),
            updated_by: input.created_by,
            created_at: now,
            updated_at: now,
            usage_count: 0,
            last_used_at: None,
            deleted: false,
        };

        templates.insert(template.template_id.clone(), template.clone());
        self.logger.info(&format!(
            "created template {} v{} ({})",
            template.template_name, template.version, template.template_id
        ));
        Ok(template)
    }

    /// Update the identified version in place.
    pub async fn update_template(
        &self,
        template_id: &str,
        update: TemplateUpdate,
    ) -> NotifyResult<Template> {
        let mut templates = self.templates.write().await;
        let template = templates
            .get_mut(template_id)
            .filter(|t| !t.deleted)
            .ok_or_else(|| NotifyError::not_found(format!("Template not found: {}", template_id)))?;

        // Validate the candidate content before anything is applied.
        let next_subject = update
            .subject_template
            .as_deref()
            .unwrap_or(&template.subject_template);
        let next_content = update
            .content_template
            .as_deref()
            .unwrap_or(&template.content_template);
        self.validate_content(next_subject, next_content)?;

        if let Some(display_name) = update.display_name {
            template.display_name = display_name;
        }
        if let Some(description) = update.description {
            template.description = Some(description);
        }
        if let Some(subject) = update.subject_template {
            template.subject_template = subject;
        }
        if let Some(content) = update.content_template {
            template.content_template = content;
        }
        if let Some(html) = update.html_template {
            template.html_template = html;
        }
        if let Some(priority) = update.default_priority {
            template.default_priority = priority;
        }
        if let Some(rate_limit) = update.rate_limit_per_hour {
            template.rate_limit_per_hour = rate_limit;
        }
        if !update.updated_by.is_empty() {
            template.updated_by = update.updated_by;
        }
        template.updated_at = Utc::now();

        let updated = template.clone();
        drop(templates);

        self.invalidate_render_cache(&updated.template_name).await;
        Ok(updated)
    }

    /// Deactivate the current version and insert version+1 as the new active
    /// version, atomically under the write lock.
    pub async fn create_new_version(&self, template_id: &str) -> NotifyResult<Template> {
        let mut templates = self.templates.write().await;
        let current = templates
            .get(template_id)
            .filter(|t| !t.deleted)
            .cloned()
            .ok_or_else(|| NotifyError::not_found(format!("Template not found: {}", template_id)))?;

        let name = current.template_name.clone();
        let next_version = templates
            .values()
            .filter(|t| t.template_name == name && !t.deleted)
            .map(|t| t.version)
            .max()
            .unwrap_or(current.version)
            + 1;

        for template in templates.values_mut() {
            if template.template_name == name && template.active {
                template.active = false;
                template.updated_at = Utc::now();
            }
        }

        let now = Utc::now();
        let successor = Template {
            template_id: uuid::Uuid::new_v4().to_string(),
            version: next_version,
            active: true,
            created_at: now,
            updated_at: now,
            usage_count: 0,
            last_used_at: None,
            ..current
        };
        templates.insert(successor.template_id.clone(), successor.clone());
        drop(templates);

        self.invalidate_render_cache(&name).await;
        self.logger
            .info(&format!("created template version {} v{}", name, next_version));
        Ok(successor)
    }

    /// Flip the active flag; activating a version deactivates its siblings so
    /// at most one version per name is active.
    pub async fn set_active(&self, template_id: &str, active: bool) -> NotifyResult<Template> {
        let mut templates = self.templates.write().await;
        let name = templates
            .get(template_id)
            .filter(|t| !t.deleted)
            .map(|t| t.template_name.clone())
            .ok_or_else(|| NotifyError::not_found(format!("Template not found: {}", template_id)))?;

        if active {
            for template in templates.values_mut() {
                if template.template_name == name && template.template_id != template_id {
                    template.active = false;
                }
            }
        }

        let template = templates.get_mut(template_id).unwrap();
        template.active = active;
        template.updated_at = Utc::now();
        let updated = template.clone();
        drop(templates);

        self.invalidate_render_cache(&name).await;
        Ok(updated)
    }

    pub async fn soft_delete(&self, template_id: &str) -> NotifyResult<()> {
        let mut templates = self.templates.write().await;
        let template = templates
            .get_mut(template_id)
            .ok_or_else(|| NotifyError::not_found(format!("Template not found: {}", template_id)))?;
        template.deleted = true;
        template.active = false;
        template.updated_at = Utc::now();
        let name = template.template_name.clone();
        drop(templates);

        self.invalidate_render_cache(&name).await;
        Ok(())
    }

    // ============= RENDERING =============

    /// Substitute every `{{name}}` placeholder with the mapped value. Missing
    /// variables render as the empty string and are logged at DEBUG. Pure for
    /// a given (template, variables) pair.
    pub async fn render(
        &self,
        template: &Template,
        variables: &HashMap<String, String>,
    ) -> NotifyResult<RenderedMessage> {
        if self.config.enable_render_cache {
            let cache_key = Self::render_cache_key(template, variables);
            if let Some(cached) = self.cached_render(&cache_key).await {
                return Ok(cached);
            }
            let rendered = self.render_uncached(template, variables);
            self.store_render(cache_key, rendered.clone()).await;
            self.bump_usage(&template.template_id).await;
            return Ok(rendered);
        }

        let rendered = self.render_uncached(template, variables);
        self.bump_usage(&template.template_id).await;
        Ok(rendered)
    }

    fn render_uncached(
        &self,
        template: &Template,
        variables: &HashMap<String, String>,
    ) -> RenderedMessage {
        RenderedMessage {
            subject: Some(self.substitute(&template.subject_template, variables)),
            content: self.substitute(&template.content_template, variables),
            html: template
                .html_template
                .as_deref()
                .map(|html| self.substitute(html, variables)),
        }
    }

    fn substitute(&self, text: &str, variables: &HashMap<String, String>) -> String {
        placeholder_regex()
            .replace_all(text, |captures: &regex::Captures| {
                let name = &captures[1];
                match variables.get(name) {
                    Some(value) => value.clone(),
                    None => {
                        self.logger
                            .debug(&format!("missing template variable: {}", name));
                        String::new()
                    }
                }
            })
            .into_owned()
    }

    fn validate_content(&self, subject: &str, content: &str) -> NotifyResult<()> {
        if content.trim().is_empty() {
            return Err(NotifyError::validation_error(
                "Template content cannot be empty",
            ));
        }
        if subject.len() > self.config.max_subject_length {
            return Err(NotifyError::validation_error(format!(
                "Subject template too long: {} > {}",
                subject.len(),
                self.config.max_subject_length
            )));
        }
        if content.len() > self.config.max_content_length {
            return Err(NotifyError::validation_error(format!(
                "Content template too long: {} > {}",
                content.len(),
                self.config.max_content_length
            )));
        }
        Ok(())
    }

    fn render_cache_key(template: &Template, variables: &HashMap<String, String>) -> String {
        let mut pairs: Vec<(&String, &String)> = variables.iter().collect();
        pairs.sort();
        let mut key = format!(
            "{}:{}:{}",
            template.template_name,
            template.template_id,
            template.updated_at.timestamp()
        );
        for (name, value) in pairs {
            key.push_str(&format!("|{}={}", name, value));
        }
        key
    }

    async fn cached_render(&self, key: &str) -> Option<RenderedMessage> {
        let cache = self.render_cache.read().await;
        let (rendered, stored_at) = cache.get(key)?;
        if Utc::now().timestamp() - stored_at > self.config.render_cache_ttl_seconds {
            return None;
        }
        Some(rendered.clone())
    }

    async fn store_render(&self, key: String, rendered: RenderedMessage) {
        let mut cache = self.render_cache.write().await;
        cache.insert(key, (rendered, Utc::now().timestamp()));
    }

    async fn invalidate_render_cache(&self, name: &str) {
        // Cache keys embed the template id + updated_at, so stale entries can
        // never be served; dropping by prefix keeps the map bounded.
        let mut cache = self.render_cache.write().await;
        cache.retain(|key, _| !key.starts_with(name));
    }

    // ============= SYSTEM TEMPLATES =============

    /// Register the built-in templates backing the canonical event mapping.
    /// Idempotent: names that already exist are left untouched.
    pub async fn seed_system_templates(&self) -> NotifyResult<usize> {
        let mut seeded = 0;
        for input in Self::system_templates() {
            match self.create_template(input).await {
                Ok(_) => seeded += 1,
                Err(err) if err.kind == crate::utils::ErrorKind::AlreadyExists => {}
                Err(err) => return Err(err),
            }
        }
        if seeded > 0 {
            self.logger
                .info(&format!("seeded {} system templates", seeded));
        }
        Ok(seeded)
    }

    fn system_template(
        name: &str,
        display: &str,
        category: TemplateCategory,
        priority: Priority,
        subject: &str,
        content: &str,
        html: Option<&str>,
    ) -> NewTemplate {
        NewTemplate {
            template_name: name.to_string(),
            display_name: display.to_string(),
            description: None,
            channel: Channel::Email,
            category,
            subject_template: subject.to_string(),
            content_template: content.to_string(),
            html_template: html.map(|h| h.to_string()),
            default_priority: priority,
            rate_limit_per_hour: None,
            created_by: "system".to_string(),
        }
    }

    fn system_templates() -> Vec<NewTemplate> {
        vec![
            Self::system_template(
                "order_execution_alert",
                "Order execution alert",
                TemplateCategory::Trading,
                Priority::Medium,
                "Order filled: {{symbol}} at {{avg_execution_price}}",
                "Hi {{user_name}},\n\nYour order {{order_id}} filled: {{filled_quantity}} {{symbol}} at {{avg_execution_price}}.",
                Some("<p>Hi {{user_name}},</p><p>Your order <b>{{order_id}}</b> filled: {{filled_quantity}} {{symbol}} at {{avg_execution_price}}.</p>"),
            ),
            Self::system_template(
                "order_rejected_alert",
                "Order rejected alert",
                TemplateCategory::Trading,
                Priority::High,
                "Order rejected: {{symbol}}",
                "Hi {{user_name}},\n\nYour order {{order_id}} for {{symbol}} was rejected: {{reason}}.",
                None,
            ),
            Self::system_template(
                "order_cancelled_alert",
                "Order cancelled alert",
                TemplateCategory::Trading,
                Priority::Medium,
                "Order cancelled: {{symbol}}",
                "Hi {{user_name}},\n\nYour order {{order_id}} for {{symbol}} was cancelled.",
                None,
            ),
            Self::system_template(
                "deposit_completed_alert",
                "Deposit completed alert",
                TemplateCategory::Account,
                Priority::Medium,
                "Deposit completed: {{amount}} {{currency}}",
                "Hi {{user_name}},\n\nYour deposit of {{amount}} {{currency}} has completed.",
                None,
            ),
            Self::system_template(
                "withdrawal_completed_alert",
                "Withdrawal completed alert",
                TemplateCategory::Account,
                Priority::Medium,
                "Withdrawal completed: {{amount}} {{currency}}",
                "Hi {{user_name}},\n\nYour withdrawal of {{amount}} {{currency}} has completed.",
                None,
            ),
            Self::system_template(
                "payment_failed_alert",
                "Payment failed alert",
                TemplateCategory::Account,
                Priority::High,
                "Payment failed: {{amount}} {{currency}}",
                "Hi {{user_name}},\n\nYour payment of {{amount}} {{currency}} failed: {{reason}}.",
                None,
            ),
            Self::system_template(
                "security_alert",
                "Security alert",
                TemplateCategory::Security,
                Priority::Urgent,
                "SECURITY ALERT: {{event}}",
                "Hi {{user_name}},\n\n{{event}} detected on your account from {{ip_address}} ({{location}}). If this was not you, secure your account immediately.",
                None,
            ),
            Self::system_template(
                "kyc_status_alert",
                "KYC status alert",
                TemplateCategory::Account,
                Priority::Medium,
                "Identity verification update",
                "Hi {{user_name}},\n\nYour identity verification status is now: {{status}}.",
                None,
            ),
            Self::system_template(
                "balance_updated_alert",
                "Balance updated alert",
                TemplateCategory::Trading,
                Priority::Low,
                "Balance update: {{symbol}}",
                "Hi {{user_name}},\n\nYour {{symbol}} balance changed to {{balance}}.",
                None,
            ),
            Self::system_template(
                "position_closed_alert",
                "Position closed alert",
                TemplateCategory::Trading,
                Priority::Medium,
                "Position closed: {{symbol}}",
                "Hi {{user_name}},\n\nYour {{symbol}} position closed with P&L {{pnl}}.",
                None,
            ),
            Self::system_template(
                "performance_alert",
                "Performance alert",
                TemplateCategory::Trading,
                Priority::Low,
                "Portfolio performance: {{period}}",
                "Hi {{user_name}},\n\nYour portfolio changed {{change_percent}}% over the last {{period}}.",
                None,
            ),
        ]
    }

    async fn bump_usage(&self, template_id: &str) {
        let mut templates = self.templates.write().await;
        if let Some(template) = templates.get_mut(template_id) {
            template.usage_count += 1;
            template.last_used_at = Some(Utc::now());
        }
    }
}
