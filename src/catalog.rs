//! Known App Store Connect measures and how they map onto destination tables.

use serde::{Deserialize, Serialize};

/// Column type a metric is stored as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MetricKind {
    Int64,
    Float64,
}

/// Metadata for one measure of the analytics API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricInfo {
    /// Measure identifier as the API spells it (`installs`).
    pub id: &'static str,
    /// Base of the destination table and name of the value column (`installations`).
    pub name: &'static str,
    pub description: &'static str,
    /// Only counts users who opted in to sharing diagnostics.
    pub opt_in: bool,
    pub kind: MetricKind,
}

/// Dimensions exported by default.
pub const DEFAULT_DIMENSIONS: &[&str] = &["app_referrer"];

/// Every dimension the portal can group by.
pub const ALL_DIMENSIONS: &[&str] = &[
    "app_referrer",
    "app_version",
    "campaign",
    "platform",
    "platform_version",
    "region",
    "source",
    "storefront",
    "web_referrer",
];

pub const METRICS: &[MetricInfo] = &[
    MetricInfo {
        id: "activeDevices",
        name: "active_devices",
        description: "The number of devices with at least one session during the selected period. Only devices with iOS 8 and tvOS 9 or later are included.",
        opt_in: true,
        kind: MetricKind::Int64,
    },
    MetricInfo {
        id: "crashes",
        name: "crashes",
        description: "The total number of crashes. Actual crash reports are available in xCode.",
        opt_in: true,
        kind: MetricKind::Int64,
    },
    MetricInfo {
        id: "iap",
        name: "iap",
        description: "The number of first-time purchases of an in-app purchase on a device using iOS 8 and tvOS 9 or later. Restored in-app purchases are not counted.",
        opt_in: false,
        kind: MetricKind::Int64,
    },
    MetricInfo {
        id: "impressionsTotal",
        name: "impressions",
        description: "Number of times the app was viewed in the Featured, Categories, Top Charts and Search Sections of the App Store. Also includes views of the product page.",
        opt_in: false,
        kind: MetricKind::Int64,
    },
    MetricInfo {
        id: "impressionsTotalUnique",
        name: "impressions_unique_device",
        description: "Number of times the app was viewed in the Featured, Categories, Top Charts and Search Sections of the App Store by a unique device. Also includes views of the product page.",
        opt_in: false,
        kind: MetricKind::Int64,
    },
    MetricInfo {
        id: "installs",
        name: "installations",
        description: "The total number of times your app has been installed on an iOS device with iOS 8 and tvOS 9 or later. Re-downloads on the same device, downloads to multiple devices sharing the same apple ID and Family Sharing installations are included. Updates are not included.",
        opt_in: true,
        kind: MetricKind::Int64,
    },
    MetricInfo {
        id: "optin",
        name: "rate",
        description: "Opt-in rate of users who have agreed to share their diagnostic and usage information with app developers. This applies to installations, sessions, active devices, active last 30 days, crashes, and deletions. Each day represents the average opt-in rate of all users who installed Apps during the last 30 days.",
        opt_in: true,
        kind: MetricKind::Float64,
    },
    MetricInfo {
        id: "pageViewCount",
        name: "product_page_views",
        description: "Number of times the app's product page has been viewed on devices iOS 8 and tvOS 9 or later. Includes both App Store app and Storekit API",
        opt_in: false,
        kind: MetricKind::Int64,
    },
    MetricInfo {
        id: "pageViewUnique",
        name: "product_page_views_unique_device",
        description: "Number of times the app's product page has been viewed on devices iOS 8 and tvOS 9 or later by a unique device. Includes both App Store app and Storekit API",
        opt_in: false,
        kind: MetricKind::Int64,
    },
    MetricInfo {
        id: "payingUsers",
        name: "paying_users",
        description: "The number of unique users that paid for an app or in-app purchase.",
        opt_in: false,
        kind: MetricKind::Int64,
    },
    MetricInfo {
        id: "rollingActiveDevices",
        name: "active_devices_last_30_days",
        description: "The total number of devices with at least one session within 30 days of the selected day",
        opt_in: true,
        kind: MetricKind::Int64,
    },
    MetricInfo {
        id: "sales",
        name: "sales",
        description: "The total amount billed to customers for purchasing apps, app bundles, and in-app purchases. Taxes are only included in the sales if those taxes were included in the App Store price. Not the same as proceeds (sales including Apple's 30% cut)",
        opt_in: false,
        kind: MetricKind::Int64,
    },
    MetricInfo {
        id: "sessions",
        name: "sessions",
        description: "Opt-In. The number of times the app has been used for at least two seconds. If the app is in the background and is later used again that counts as another session.",
        opt_in: true,
        kind: MetricKind::Int64,
    },
    MetricInfo {
        id: "uninstalls",
        name: "deletions",
        description: "The number of times your app has been deleted on devices running iOS 12.3 or tvOS 13.0 or later.",
        opt_in: true,
        kind: MetricKind::Int64,
    },
    MetricInfo {
        id: "units",
        name: "app_units",
        description: "The number of first-time app purchases made on the App Store using iOS 8 and tvOS 9 or later. Updates, re-downloads, download onto other devices are not counted. Family sharing downloads are included for free apps, but not for paid apps.",
        opt_in: false,
        kind: MetricKind::Int64,
    },
];

/// Look up a measure by its API identifier.
pub fn metric(id: &str) -> Option<&'static MetricInfo> {
    METRICS.iter().find(|m| m.id == id)
}

/// Destination table for a measure, optionally broken down by a dimension.
///
/// `<name>_total` without a dimension, `<name>_by_[opt_in_]<dimension>` with one.
pub fn table_name(metric: &MetricInfo, dimension: Option<&str>) -> String {
    match dimension {
        Some(dimension) => {
            let opt_in = if metric.opt_in { "opt_in_" } else { "" };
            format!("{}_by_{opt_in}{dimension}", metric.name)
        }
        None => format!("{}_total", metric.name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_and_names_are_unique() {
        let ids: HashSet<_> = METRICS.iter().map(|m| m.id).collect();
        let names: HashSet<_> = METRICS.iter().map(|m| m.name).collect();
        assert_eq!(ids.len(), METRICS.len());
        assert_eq!(names.len(), METRICS.len());
    }

    #[test]
    fn opt_in_metric_with_dimension() {
        let sessions = metric("sessions").expect("sessions");
        assert_eq!(
            table_name(sessions, Some("app_referrer")),
            "sessions_by_opt_in_app_referrer"
        );
    }

    #[test]
    fn plain_metric_without_dimension() {
        let units = metric("units").expect("units");
        assert_eq!(table_name(units, None), "app_units_total");
        assert_eq!(table_name(units, Some("region")), "app_units_by_region");
    }

    #[test]
    fn opt_in_metric_total_has_no_opt_in_segment() {
        let crashes = metric("crashes").expect("crashes");
        assert_eq!(table_name(crashes, None), "crashes_total");
    }

    #[test]
    fn only_rate_is_floating_point() {
        let floats: Vec<_> = METRICS
            .iter()
            .filter(|m| m.kind == MetricKind::Float64)
            .map(|m| m.id)
            .collect();
        assert_eq!(floats, vec!["optin"]);
    }

    #[test]
    fn descriptions_keep_the_portal_caveats() {
        let text = |id: &str| metric(id).expect(id).description;
        assert!(text("sales").ends_with("Not the same as proceeds (sales including Apple's 30% cut)"));
        assert!(text("units").contains("Family sharing downloads are included for free apps"));
        assert!(text("installs").contains("Family Sharing installations are included"));
        assert!(text("optin").starts_with("Opt-in rate of users"));
    }

    #[test]
    fn default_dimensions_are_known() {
        for dim in DEFAULT_DIMENSIONS {
            assert!(ALL_DIMENSIONS.contains(dim));
        }
        assert!(metric("unknown").is_none());
    }
}
