// Per-user notification preferences: channel opt-ins, quiet hours, contact
// info and frequency caps.

use crate::types::{Channel, TemplateCategory};
use crate::utils::{logger::Logger, LogLevel, NotifyError, NotifyResult};
use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

/// A user's personal notification policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPreference {
    pub user_id: String,
    pub notifications_enabled: bool,
    pub preferred_channel: Channel,
    pub enabled_channels: HashSet<Channel>,
    pub enabled_categories: HashSet<TemplateCategory>,
    pub email_address: Option<String>,
    pub phone_number: Option<String>,
    pub quiet_hours_enabled: bool,
    pub quiet_start: NaiveTime,
    pub quiet_end: NaiveTime,
    /// "UTC" or "UTC±HH:MM"; resolved by the dispatcher when gating.
    pub time_zone: String,
    pub frequency_limit_per_hour: u32,
    pub frequency_limit_per_day: u32,
    pub language: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserPreference {
    /// Defaults applied on first creation.
    pub fn new_default(user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            notifications_enabled: true,
            preferred_channel: Channel::Email,
            enabled_channels: HashSet::from([Channel::Email, Channel::InApp]),
            enabled_categories: TemplateCategory::standard().into_iter().collect(),
            email_address: None,
            phone_number: None,
            quiet_hours_enabled: false,
            quiet_start: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            quiet_end: NaiveTime::from_hms_opt(7, 0, 0).unwrap(),
            time_zone: "UTC".to_string(),
            frequency_limit_per_hour: 20,
            frequency_limit_per_day: 100,
            language: "en".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    /// True iff notifications are on, the channel is opted in and the
    /// category is not opted out.
    pub fn allows(&self, channel: Channel, category: &TemplateCategory) -> bool {
        self.notifications_enabled
            && self.enabled_channels.contains(&channel)
            && self.enabled_categories.contains(category)
    }

    /// Quiet-hours check against a wall-clock time already in the user's
    /// time zone. Handles windows that wrap midnight (e.g. 22:00 -> 07:00).
    pub fn is_quiet_at(&self, local_time: NaiveTime) -> bool {
        if !self.quiet_hours_enabled {
            return false;
        }
        if self.quiet_start == self.quiet_end {
            return false;
        }
        if self.quiet_start < self.quiet_end {
            local_time >= self.quiet_start && local_time < self.quiet_end
        } else {
            local_time >= self.quiet_start || local_time < self.quiet_end
        }
    }
}

/// Field-scoped quiet-hours update.
#[derive(Debug, Clone)]
pub struct QuietHoursUpdate {
    pub enabled: bool,
    pub quiet_start: NaiveTime,
    pub quiet_end: NaiveTime,
    pub time_zone: String,
}

/// Field-scoped contact-info update.
#[derive(Debug, Clone, Default)]
pub struct ContactUpdate {
    pub email_address: Option<Option<String>>,
    pub phone_number: Option<Option<String>>,
}

/// Shared, read-mostly preference catalog. Writers (admin/user mutations) are
/// rare and take the write lock briefly.
pub struct PreferenceStore {
    preferences: RwLock<HashMap<String, UserPreference>>,
    logger: Logger,
}

impl PreferenceStore {
    pub fn new() -> Self {
        Self {
            preferences: RwLock::new(HashMap::new()),
            logger: Logger::new(LogLevel::Info),
        }
    }

    pub async fn get(&self, user_id: &str) -> Option<UserPreference> {
        let preferences = self.preferences.read().await;
        preferences.get(user_id).cloned()
    }

    pub async fn get_or_create(&self, user_id: &str) -> UserPreference {
        if let Some(existing) = self.get(user_id).await {
            return existing;
        }
        let mut preferences = self.preferences.write().await;
        preferences
            .entry(user_id.to_string())
            .or_insert_with(|| {
                self.logger
                    .info(&format!("created default preferences for user {}", user_id));
                UserPreference::new_default(user_id)
            })
            .clone()
    }

    pub async fn set_notifications_enabled(
        &self,
        user_id: &str,
        enabled: bool,
    ) -> NotifyResult<UserPreference> {
        self.mutate(user_id, |pref| {
            pref.notifications_enabled = enabled;
            Ok(())
        })
        .await
    }

    pub async fn update_channels(
        &self,
        user_id: &str,
        preferred: Channel,
        enabled: HashSet<Channel>,
    ) -> NotifyResult<UserPreference> {
        self.mutate(user_id, |pref| {
            if !enabled.contains(&preferred) {
                return Err(NotifyError::validation_error(
                    "Preferred channel must be among the enabled channels",
                ));
            }
            pref.preferred_channel = preferred;
            pref.enabled_channels = enabled;
            Ok(())
        })
        .await
    }

    pub async fn update_contact(
        &self,
        user_id: &str,
        update: ContactUpdate,
    ) -> NotifyResult<UserPreference> {
        self.mutate(user_id, |pref| {
            if let Some(email) = update.email_address.clone() {
                if let Some(addr) = &email {
                    if !addr.contains('@') {
                        return Err(NotifyError::validation_error(format!(
                            "Invalid email address: {}",
                            addr
                        )));
                    }
                }
                pref.email_address = email;
            }
            if let Some(phone) = update.phone_number.clone() {
                if let Some(number) = &phone {
                    if !number.starts_with('+') || number.len() < 8 {
                        return Err(NotifyError::validation_error(format!(
                            "Phone number must be E.164 formatted: {}",
                            number
                        )));
                    }
                }
                pref.phone_number = phone;
            }
            Ok(())
        })
        .await
    }

    pub async fn update_quiet_hours(
        &self,
        user_id: &str,
        update: QuietHoursUpdate,
    ) -> NotifyResult<UserPreference> {
        self.mutate(user_id, |pref| {
            pref.quiet_hours_enabled = update.enabled;
            pref.quiet_start = update.quiet_start;
            pref.quiet_end = update.quiet_end;
            pref.time_zone = update.time_zone.clone();
            Ok(())
        })
        .await
    }

    pub async fn update_frequency(
        &self,
        user_id: &str,
        per_hour: u32,
        per_day: u32,
    ) -> NotifyResult<UserPreference> {
        self.mutate(user_id, |pref| {
            if per_hour == 0 || per_day == 0 {
                return Err(NotifyError::validation_error(
                    "Frequency limits must be greater than 0",
                ));
            }
            if per_hour > per_day {
                return Err(NotifyError::validation_error(
                    "Hourly frequency limit cannot exceed the daily limit",
                ));
            }
            pref.frequency_limit_per_hour = per_hour;
            pref.frequency_limit_per_day = per_day;
            Ok(())
        })
        .await
    }

    pub async fn enable_category(
        &self,
        user_id: &str,
        category: TemplateCategory,
    ) -> NotifyResult<UserPreference> {
        self.mutate(user_id, |pref| {
            pref.enabled_categories.insert(category.clone());
            Ok(())
        })
        .await
    }

    pub async fn disable_category(
        &self,
        user_id: &str,
        category: TemplateCategory,
    ) -> NotifyResult<UserPreference> {
        self.mutate(user_id, |pref| {
            pref.enabled_categories.remove(&category);
            Ok(())
        })
        .await
    }

    /// Gate used by the dispatcher. Users with no stored preferences are not
    /// gated; the dispatcher treats absence as consent.
    pub async fn is_notification_allowed(
        &self,
        user_id: &str,
        channel: Channel,
        category: &TemplateCategory,
    ) -> bool {
        match self.get(user_id).await {
            Some(pref) => pref.allows(channel, category),
            None => true,
        }
    }

    /// Quiet-hours gate; `now_local` must already be in the user's time zone.
    pub async fn is_within_quiet_hours(&self, user_id: &str, now_local: NaiveTime) -> bool {
        match self.get(user_id).await {
            Some(pref) => pref.is_quiet_at(now_local),
            None => false,
        }
    }

    async fn mutate<F>(&self, user_id: &str, apply: F) -> NotifyResult<UserPreference>
    where
        F: FnOnce(&mut UserPreference) -> NotifyResult<()>,
    {
        let mut preferences = self.preferences.write().await;
        let pref = preferences
            .entry(user_id.to_string())
            .or_insert_with(|| UserPreference::new_default(user_id));
        apply(pref)?;
        pref.updated_at = Utc::now();
        Ok(pref.clone())
    }
}

impl Default for PreferenceStore {
    fn default() -> Self {
        Self::new()
    }
}
