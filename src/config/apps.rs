//! App name to package name mapping used by `open_app`.

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Mapping from normalized app names to Android package names.
///
/// Keys are lowercase with spaces, dashes and underscores removed; see
/// [`normalize_app_name`].
pub static APP_PACKAGES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    let entries: &[(&str, &str)] = &[
        // System
        ("settings", "com.android.settings"),
        ("androidsystemsettings", "com.android.settings"),
        ("clock", "com.android.deskclock"),
        ("contacts", "com.android.contacts"),
        ("phone", "com.android.dialer"),
        ("dialer", "com.android.dialer"),
        ("messages", "com.android.mms"),
        ("camera", "com.android.camera"),
        ("gallery", "com.android.gallery3d"),
        ("calculator", "com.android.calculator2"),
        ("calendar", "com.android.calendar"),
        ("files", "com.android.fileexplorer"),
        ("filemanager", "com.android.fileexplorer"),
        ("audiorecorder", "com.android.soundrecorder"),
        // Google
        ("chrome", "com.android.chrome"),
        ("googlechrome", "com.android.chrome"),
        ("gmail", "com.google.android.gm"),
        ("maps", "com.google.android.apps.maps"),
        ("googlemaps", "com.google.android.apps.maps"),
        ("youtube", "com.google.android.youtube"),
        // Third party
        ("bluecoins", "com.rammigsoftware.bluecoins"),
        ("broccoli", "com.flauschcode.broccoli"),
        ("booking", "com.booking"),
        ("booking.com", "com.booking"),
        ("duolingo", "com.duolingo"),
        ("expedia", "com.expedia.bookings"),
        ("微信", "com.tencent.mm"),
        ("qq", "com.tencent.mobileqq"),
        ("淘宝", "com.taobao.taobao"),
        ("京东", "com.jingdong.app.mall"),
        ("小红书", "com.xingin.xhs"),
        ("高德地图", "com.autonavi.minimap"),
        ("美团", "com.sankuai.meituan"),
        ("bilibili", "tv.danmaku.bili"),
        ("抖音", "com.ss.android.ugc.aweme"),
        ("设置", "com.android.settings"),
    ];
    entries.iter().copied().collect()
});

/// Lowercase and drop separators so "Google Chrome" and "google-chrome" match.
pub fn normalize_app_name(name: &str) -> String {
    name.trim()
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '_'))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Resolve an app name to a package.
///
/// Names that already look like a package (`com.example.app`) are returned as-is.
pub fn resolve_package(app_name: &str) -> Option<String> {
    if let Some(package) = APP_PACKAGES.get(normalize_app_name(app_name).as_str()) {
        return Some(package.to_string());
    }
    let trimmed = app_name.trim();
    let looks_like_package = trimmed.split('.').count() >= 2
        && trimmed
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    looks_like_package.then(|| trimmed.to_string())
}
