//! Built-in rules for the artifacts agents upload by default.

use std::sync::LazyLock;

use hinv_core::{FactUpdate, HostFact};
use regex::Regex;
use serde_json::Value as JsonValue;

use crate::{ExtractorRegistry, FnExtractor, RegistryError};

pub const REDHAT_RELEASE: &str = "/etc/redhat-release";
pub const DPKG_QUERY: &str = "/usr/bin/dpkg-query -l";
pub const DEBIAN_VERSION: &str = "/etc/debian_version";
pub const LSB_RELEASE: &str = "/etc/lsb-release";
pub const SW_VERS: &str = "/usr/bin/sw_vers";
pub const WINDOWS_CAPTION: &str = "(Get-WmiObject Win32_OperatingSystem).Caption";
pub const WINDOWS_OS_VERSION: &str = "[System.Environment]::OSVersion|ConvertTo-Json";
pub const WINDOWS_SYSTEM_PRODUCT: &str =
    "Get-WmiObject Win32_computersystemproduct|Select Name,Vendor|ConvertTo-Json";
pub const UNAME: &str = "/bin/uname -a";
pub const DMIDECODE_SYSTEM: &str = "/usr/sbin/dmidecode -t system";
pub const OS_RELEASE_EDITION_PATTERN: &str = r"^/usr/lib/os\.release\.d/os-release-([a-z]+)$";

/// The default rule set. Fails only if the registrations overlap.
pub fn builtin_registry() -> Result<ExtractorRegistry, RegistryError> {
    ExtractorRegistry::builder()
        .exact(REDHAT_RELEASE, FnExtractor::new("redhat-release", redhat_release))
        .pattern(
            OS_RELEASE_EDITION_PATTERN,
            &[
                "/usr/lib/os.release.d/os-release-workstation",
                "/usr/lib/os.release.d/os-release-server",
            ],
            FnExtractor::new("os-release-edition", os_release_edition),
        )
        .exact(DPKG_QUERY, FnExtractor::new("dpkg-ubuntu-edition", dpkg_ubuntu_edition))
        .exact(DEBIAN_VERSION, FnExtractor::new("debian-version", debian_version))
        .exact(LSB_RELEASE, FnExtractor::new("lsb-release", lsb_release))
        .exact(SW_VERS, FnExtractor::new("sw-vers", sw_vers))
        .exact(WINDOWS_CAPTION, FnExtractor::new("windows-caption", windows_caption))
        .exact(WINDOWS_OS_VERSION, FnExtractor::new("windows-os-version", windows_os_version))
        .exact(
            WINDOWS_SYSTEM_PRODUCT,
            FnExtractor::new("windows-system-product", windows_system_product),
        )
        .exact(UNAME, FnExtractor::new("uname", uname))
        .exact(DMIDECODE_SYSTEM, FnExtractor::new("dmidecode-system", dmidecode_system))
        .build()
}

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("built-in pattern compiles")
}

static RHEL: LazyLock<Regex> = LazyLock::new(|| re(r"^Red Hat Enterprise Linux (\w+).*(Tikanga|Santiago|Maipo)"));
static FEDORA: LazyLock<Regex> = LazyLock::new(|| re(r"^Fedora release (\d+)"));
static CENTOS: LazyLock<Regex> = LazyLock::new(|| re(r"^CentOS Linux release (\d+)"));
static OS_RELEASE_EDITION: LazyLock<Regex> = LazyLock::new(|| re(OS_RELEASE_EDITION_PATTERN));
static UBUNTU_EDITION: LazyLock<Regex> = LazyLock::new(|| re(r"ubuntu-(desktop|server)"));
static DEBIAN_MAJOR: LazyLock<Regex> = LazyLock::new(|| re(r"^(\d+)\."));
static UBUNTU_LSB: LazyLock<Regex> =
    LazyLock::new(|| re(r"DISTRIB_ID=Ubuntu(?s:.*)DISTRIB_RELEASE=(\d+)\.(\d+)"));
static SW_VERS_MACOS: LazyLock<Regex> = LazyLock::new(|| {
    re(r"ProductName:\s+(?:Mac OS X|macOS)[ \t]*\r?\nProductVersion:\s+(\d+\.\d+)")
});
static WINDOWS_DESKTOP: LazyLock<Regex> = LazyLock::new(|| re(r"Microsoft Windows (\d+)"));
static WINDOWS_SERVER: LazyLock<Regex> =
    LazyLock::new(|| re(r"Microsoft Windows Server (\d+)( R2)?"));
static UNAME_FIELDS: LazyLock<Regex> = LazyLock::new(|| re(r"^(\S+) \S+ (\S+)"));
static LEADING_DIGITS: LazyLock<Regex> = LazyLock::new(|| re(r"^(\d+)"));
static DMI_SYSTEM_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    re(r"(?ms)^System Information[ \t]*\r?\n(.*?)(?:^[ \t]*\r?$|\z)")
});
static DMI_MANUFACTURER: LazyLock<Regex> =
    LazyLock::new(|| re(r"(?m)^[ \t]*Manufacturer:[ \t]*(.*?)[ \t\r]*$"));
static DMI_PRODUCT: LazyLock<Regex> =
    LazyLock::new(|| re(r"(?m)^[ \t]*Product Name:[ \t]*(.*?)[ \t\r]*$"));
static DMI_SERIAL: LazyLock<Regex> =
    LazyLock::new(|| re(r"(?m)^[ \t]*Serial Number:[ \t]*(.*?)[ \t\r]*$"));

/// Red Hat Enterprise Linux codenames by major release.
const RHEL_CODENAMES: &[(&str, u32)] = &[("Tikanga", 5), ("Santiago", 6), ("Maipo", 7)];

/// Manufacturer strings rewritten to their canonical vendor name.
const VENDOR_NAMES: &[(&str, &str)] = &[("HP", "Hewlett-Packard"), ("HITACHI", "Hitachi")];

/// Firmware filler that means "unknown".
const DMI_PLACEHOLDERS: &[&str] = &[
    "Not Specified",
    "Not Available",
    "To Be Filled By O.E.M.",
    "Default string",
    "System Product Name",
    "System manufacturer",
    "None",
];

fn one(update: FactUpdate) -> Vec<FactUpdate> {
    if update.is_empty() {
        Vec::new()
    } else {
        vec![update]
    }
}

/// Uppercases the first letter of every whitespace-separated word.
pub fn title_case(input: &str) -> String {
    input
        .split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn normalize_vendor(raw: &str) -> String {
    let trimmed = raw.trim();
    VENDOR_NAMES
        .iter()
        .find(|(from, _)| *from == trimmed)
        .map(|(_, to)| (*to).to_string())
        .unwrap_or_else(|| trimmed.to_string())
}

fn dmi_value(raw: &str) -> Option<String> {
    let value = raw.trim();
    if value.is_empty() || DMI_PLACEHOLDERS.iter().any(|p| p.eq_ignore_ascii_case(value)) {
        None
    } else {
        Some(value.to_string())
    }
}

pub fn redhat_release(_name: &str, content: &str) -> Vec<FactUpdate> {
    if let Some(m) = RHEL.captures(content) {
        let Some((_, major)) = RHEL_CODENAMES.iter().find(|(codename, _)| *codename == &m[2]) else {
            return Vec::new();
        };
        return one(
            FactUpdate::new()
                .set(HostFact::Os, format!("RHEL {major}"))
                .set(HostFact::OsEdition, &m[1]),
        );
    }
    if let Some(m) = FEDORA.captures(content) {
        return one(FactUpdate::new().set(HostFact::Os, format!("Fedora {}", &m[1])));
    }
    if let Some(m) = CENTOS.captures(content) {
        return one(FactUpdate::new().set(HostFact::Os, format!("CentOS {}", &m[1])));
    }
    Vec::new()
}

pub fn os_release_edition(name: &str, _content: &str) -> Vec<FactUpdate> {
    match OS_RELEASE_EDITION.captures(name) {
        Some(m) => one(FactUpdate::new().set(HostFact::OsEdition, title_case(&m[1]))),
        None => Vec::new(),
    }
}

pub fn dpkg_ubuntu_edition(_name: &str, content: &str) -> Vec<FactUpdate> {
    match UBUNTU_EDITION.captures(content) {
        Some(m) => one(FactUpdate::new().set(HostFact::OsEdition, title_case(&m[1]))),
        None => Vec::new(),
    }
}

pub fn debian_version(_name: &str, content: &str) -> Vec<FactUpdate> {
    match DEBIAN_MAJOR.captures(content) {
        Some(m) => one(FactUpdate::new().set(HostFact::Os, format!("Debian {}", &m[1]))),
        None => Vec::new(),
    }
}

pub fn lsb_release(_name: &str, content: &str) -> Vec<FactUpdate> {
    match UBUNTU_LSB.captures(content) {
        Some(m) => one(FactUpdate::new().set(HostFact::Os, format!("Ubuntu {}.{}", &m[1], &m[2]))),
        None => Vec::new(),
    }
}

pub fn sw_vers(_name: &str, content: &str) -> Vec<FactUpdate> {
    match SW_VERS_MACOS.captures(content) {
        Some(m) => one(
            FactUpdate::new()
                .set(HostFact::Os, format!("macOS {}", &m[1]))
                .clearing_edition(),
        ),
        None => Vec::new(),
    }
}

pub fn windows_caption(_name: &str, content: &str) -> Vec<FactUpdate> {
    if let Some(m) = WINDOWS_DESKTOP.captures(content) {
        return one(
            FactUpdate::new()
                .set(HostFact::Os, format!("Windows {}", &m[1]))
                .clearing_edition(),
        );
    }
    if let Some(m) = WINDOWS_SERVER.captures(content) {
        let qualifier = m.get(2).map(|q| q.as_str()).unwrap_or_default();
        return one(
            FactUpdate::new()
                .set(HostFact::Os, format!("Windows {}{}", &m[1], qualifier))
                .set(HostFact::OsEdition, "Server"),
        );
    }
    Vec::new()
}

pub fn uname(_name: &str, content: &str) -> Vec<FactUpdate> {
    let Some(m) = UNAME_FIELDS.captures(content) else {
        return Vec::new();
    };
    let family = &m[1];
    let kernel = &m[2];
    let update = FactUpdate::new().set(HostFact::Kernel, kernel);
    if family != "FreeBSD" {
        return one(update);
    }
    let os = match LEADING_DIGITS.captures(kernel) {
        Some(v) => format!("FreeBSD {}", &v[1]),
        None => family.to_string(),
    };
    one(update.set(HostFact::Os, os).clearing_edition())
}

pub fn dmidecode_system(_name: &str, content: &str) -> Vec<FactUpdate> {
    let Some(block) = DMI_SYSTEM_BLOCK.captures(content) else {
        return Vec::new();
    };
    let info = &block[1];
    let mut update = FactUpdate::new();
    if let Some(vendor) = DMI_MANUFACTURER.captures(info).and_then(|m| dmi_value(&m[1])) {
        update = update.set(HostFact::Vendor, normalize_vendor(&vendor));
    }
    if let Some(model) = DMI_PRODUCT.captures(info).and_then(|m| dmi_value(&m[1])) {
        update = update.set(HostFact::Model, model);
    }
    if let Some(serial) = DMI_SERIAL.captures(info).and_then(|m| dmi_value(&m[1])) {
        update = update.set(HostFact::SerialNo, serial);
    }
    one(update)
}

/// PowerShell's ConvertTo-Json emits an array when several objects match;
/// the first one describes the host.
fn first_json_object(content: &str) -> Option<JsonValue> {
    let value: JsonValue = serde_json::from_str(content.trim_start_matches('\u{feff}').trim()).ok()?;
    match value {
        JsonValue::Array(items) => items.into_iter().find(JsonValue::is_object),
        JsonValue::Object(_) => Some(value),
        _ => None,
    }
}

fn json_text(value: &JsonValue, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

pub fn windows_system_product(_name: &str, content: &str) -> Vec<FactUpdate> {
    let Some(product) = first_json_object(content) else {
        return Vec::new();
    };
    let mut update = FactUpdate::new();
    if let Some(vendor) = json_text(&product, "Vendor").and_then(|v| dmi_value(&v)) {
        update = update.set(HostFact::Vendor, normalize_vendor(&vendor));
    }
    if let Some(model) = json_text(&product, "Name").and_then(|v| dmi_value(&v)) {
        update = update.set(HostFact::Model, model);
    }
    one(update)
}

pub fn windows_os_version(_name: &str, content: &str) -> Vec<FactUpdate> {
    let Some(info) = first_json_object(content) else {
        return Vec::new();
    };
    let kernel = json_text(&info, "VersionString")
        .map(|s| s.trim_start_matches("Microsoft Windows ").to_string())
        .or_else(|| {
            let version = info.get("Version")?;
            let part = |key: &str| version.get(key).and_then(JsonValue::as_i64);
            Some(format!(
                "NT {}.{}.{}.{}",
                part("Major")?,
                part("Minor")?,
                part("Build")?,
                part("Revision").unwrap_or(0)
            ))
        });
    match kernel {
        Some(kernel) => one(FactUpdate::new().set(HostFact::Kernel, kernel)),
        None => Vec::new(),
    }
}
