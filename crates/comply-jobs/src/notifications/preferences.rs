//! Preference resolution.

use comply_core::{Channel, Frequency, NotificationPreference, ANY_NOTIFICATION_TYPE};

/// Delivery frequency for (notification type, channel) given one user's
/// preference rows. An exact type beats the wildcard; no row means
/// immediate delivery.
pub fn resolve_frequency(
    preferences: &[NotificationPreference],
    notification_type: &str,
    channel: Channel,
) -> Frequency {
    let for_channel = || preferences.iter().filter(|p| p.channel == channel);

    for_channel()
        .find(|p| p.notification_type == notification_type)
        .or_else(|| for_channel().find(|p| p.notification_type == ANY_NOTIFICATION_TYPE))
        .map(|p| p.frequency)
        .unwrap_or(Frequency::Immediate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn pref(kind: &str, channel: Channel, frequency: Frequency) -> NotificationPreference {
        NotificationPreference {
            user_id: Uuid::nil(),
            notification_type: kind.to_string(),
            channel,
            frequency,
        }
    }

    #[test]
    fn test_no_preferences_is_immediate() {
        assert_eq!(
            resolve_frequency(&[], "deadline_reminder", Channel::Email),
            Frequency::Immediate
        );
    }

    #[test]
    fn test_exact_type_beats_wildcard() {
        let prefs = vec![
            pref("*", Channel::Email, Frequency::DailyDigest),
            pref("escalation", Channel::Email, Frequency::Immediate),
        ];
        assert_eq!(
            resolve_frequency(&prefs, "escalation", Channel::Email),
            Frequency::Immediate
        );
        assert_eq!(
            resolve_frequency(&prefs, "deadline_reminder", Channel::Email),
            Frequency::DailyDigest
        );
    }

    #[test]
    fn test_preferences_are_per_channel() {
        let prefs = vec![pref("*", Channel::Sms, Frequency::Disabled)];
        assert_eq!(
            resolve_frequency(&prefs, "escalation", Channel::Sms),
            Frequency::Disabled
        );
        assert_eq!(
            resolve_frequency(&prefs, "escalation", Channel::Email),
            Frequency::Immediate
        );
    }
}
