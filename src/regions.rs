//! Static region data: point-of-presence codes, the region catalogue, and the
//! latency ladder used as a last-resort guess.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Map a three-letter point-of-presence code to a region identifier.
pub fn region_for_pop(code: &str) -> Option<&'static str> {
    let region = match code.trim().to_ascii_uppercase().as_str() {
        // North America
        "EWR" | "IAD" | "ATL" | "BOS" | "DFW" | "DEN" | "SEA" | "SJC" | "LAX" | "MIA"
        | "ORD" => "us",
        "YUL" | "YYZ" | "YVR" => "ca",
        // Europe
        "LHR" | "MAN" => "uk",
        "CDG" | "MRS" => "fr",
        "AMS" => "nl",
        "FRA" | "MUC" | "DUS" => "de",
        "MAD" => "es",
        "MXP" => "it",
        "VIE" => "at",
        "PRG" => "cz",
        "WAW" => "pl",
        "BRU" => "be",
        "SOF" => "bg",
        "ZAG" => "hr",
        "CPH" => "dk",
        "HEL" => "fi",
        "ATH" => "gr",
        "BUD" => "hu",
        "OSL" => "no",
        "BUH" => "ro",
        "BEG" => "rs",
        "SVG" => "se",
        "IST" => "tr",
        "DME" | "LED" => "ru",
        "ZRH" => "ch",
        "LIS" => "pt",
        "DUB" => "ie",
        // Asia
        "HKG" => "hk",
        "TPE" => "tw",
        "NRT" | "KIX" => "jp",
        "ICN" => "kr",
        "SIN" => "sg",
        "BOM" | "MAA" | "DEL" => "in",
        "KUL" => "my",
        "BKK" => "th",
        "CGK" => "id",
        "MNL" => "ph",
        "DXB" => "ae",
        // Oceania
        "SYD" | "MEL" | "PER" => "au",
        "AKL" => "nz",
        // South America
        "GRU" | "GIG" => "br",
        "EZE" => "ar",
        "SCL" => "cl",
        "BOG" => "co",
        "LIM" => "pe",
        // Africa
        "JNB" | "CPT" => "za",
        "CAI" => "eg",
        "LOS" => "ng",
        _ => return None,
    };
    Some(region)
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Continent {
    Asia,
    Europe,
    Africa,
    NorthAmerica,
    SouthAmerica,
    Oceania,
}

impl fmt::Display for Continent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Continent::Asia => "Asia",
            Continent::Europe => "Europe",
            Continent::Africa => "Africa",
            Continent::NorthAmerica => "North America",
            Continent::SouthAmerica => "South America",
            Continent::Oceania => "Oceania",
        };
        f.write_str(s)
    }
}

impl FromStr for Continent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match key.as_str() {
            "asia" => Ok(Continent::Asia),
            "europe" => Ok(Continent::Europe),
            "africa" => Ok(Continent::Africa),
            "northamerica" => Ok(Continent::NorthAmerica),
            "southamerica" => Ok(Continent::SouthAmerica),
            "oceania" => Ok(Continent::Oceania),
            _ => Err(format!("unknown continent: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub continent: Continent,
}

const fn r(id: &'static str, name: &'static str, continent: Continent) -> RegionInfo {
    RegionInfo { id, name, continent }
}

use Continent::{Africa, Asia, Europe, NorthAmerica, Oceania, SouthAmerica};

const CATALOGUE: &[RegionInfo] = &[
    r("af", "Afghanistan", Asia),
    r("am", "Armenia", Asia),
    r("az", "Azerbaijan", Asia),
    r("bh", "Bahrain", Asia),
    r("bd", "Bangladesh", Asia),
    r("bt", "Bhutan", Asia),
    r("bn", "Brunei", Asia),
    r("kh", "Cambodia", Asia),
    r("cn", "China", Asia),
    r("cy", "Cyprus", Asia),
    r("ge", "Georgia", Asia),
    r("hk", "Hong Kong", Asia),
    r("in", "India", Asia),
    r("id", "Indonesia", Asia),
    r("ir", "Iran", Asia),
    r("iq", "Iraq", Asia),
    r("il", "Israel", Asia),
    r("jp", "Japan", Asia),
    r("jo", "Jordan", Asia),
    r("kz", "Kazakhstan", Asia),
    r("kw", "Kuwait", Asia),
    r("kg", "Kyrgyzstan", Asia),
    r("la", "Laos", Asia),
    r("lb", "Lebanon", Asia),
    r("mo", "Macau", Asia),
    r("my", "Malaysia", Asia),
    r("mv", "Maldives", Asia),
    r("mn", "Mongolia", Asia),
    r("mm", "Myanmar", Asia),
    r("np", "Nepal", Asia),
    r("kp", "North Korea", Asia),
    r("om", "Oman", Asia),
    r("pk", "Pakistan", Asia),
    r("ps", "Palestine", Asia),
    r("ph", "Philippines", Asia),
    r("qa", "Qatar", Asia),
    r("sa", "Saudi Arabia", Asia),
    r("sg", "Singapore", Asia),
    r("kr", "South Korea", Asia),
    r("lk", "Sri Lanka", Asia),
    r("sy", "Syria", Asia),
    r("tw", "Taiwan", Asia),
    r("tj", "Tajikistan", Asia),
    r("th", "Thailand", Asia),
    r("tr", "Turkey", Asia),
    r("tm", "Turkmenistan", Asia),
    r("ae", "United Arab Emirates", Asia),
    r("uz", "Uzbekistan", Asia),
    r("vn", "Vietnam", Asia),
    r("ye", "Yemen", Asia),
    r("al", "Albania", Europe),
    r("ad", "Andorra", Europe),
    r("at", "Austria", Europe),
    r("by", "Belarus", Europe),
    r("be", "Belgium", Europe),
    r("ba", "Bosnia and Herzegovina", Europe),
    r("bg", "Bulgaria", Europe),
    r("hr", "Croatia", Europe),
    r("cz", "Czechia", Europe),
    r("dk", "Denmark", Europe),
    r("ee", "Estonia", Europe),
    r("fi", "Finland", Europe),
    r("fr", "France", Europe),
    r("de", "Germany", Europe),
    r("gr", "Greece", Europe),
    r("hu", "Hungary", Europe),
    r("is", "Iceland", Europe),
    r("ie", "Ireland", Europe),
    r("it", "Italy", Europe),
    r("lv", "Latvia", Europe),
    r("li", "Liechtenstein", Europe),
    r("lt", "Lithuania", Europe),
    r("lu", "Luxembourg", Europe),
    r("mt", "Malta", Europe),
    r("md", "Moldova", Europe),
    r("mc", "Monaco", Europe),
    r("me", "Montenegro", Europe),
    r("nl", "Netherlands", Europe),
    r("mk", "North Macedonia", Europe),
    r("no", "Norway", Europe),
    r("pl", "Poland", Europe),
    r("pt", "Portugal", Europe),
    r("ro", "Romania", Europe),
    r("ru", "Russia", Europe),
    r("sm", "San Marino", Europe),
    r("rs", "Serbia", Europe),
    r("sk", "Slovakia", Europe),
    r("si", "Slovenia", Europe),
    r("es", "Spain", Europe),
    r("se", "Sweden", Europe),
    r("ch", "Switzerland", Europe),
    r("ua", "Ukraine", Europe),
    r("uk", "United Kingdom", Europe),
    r("va", "Vatican City", Europe),
    r("dz", "Algeria", Africa),
    r("ao", "Angola", Africa),
    r("bj", "Benin", Africa),
    r("bw", "Botswana", Africa),
    r("bf", "Burkina Faso", Africa),
    r("bi", "Burundi", Africa),
    r("cv", "Cape Verde", Africa),
    r("cm", "Cameroon", Africa),
    r("cf", "Central African Republic", Africa),
    r("td", "Chad", Africa),
    r("km", "Comoros", Africa),
    r("cg", "Republic of the Congo", Africa),
    r("cd", "DR Congo", Africa),
    r("dj", "Djibouti", Africa),
    r("eg", "Egypt", Africa),
    r("gq", "Equatorial Guinea", Africa),
    r("er", "Eritrea", Africa),
    r("sz", "Eswatini", Africa),
    r("et", "Ethiopia", Africa),
    r("ga", "Gabon", Africa),
    r("gm", "Gambia", Africa),
    r("gh", "Ghana", Africa),
    r("gn", "Guinea", Africa),
    r("gw", "Guinea-Bissau", Africa),
    r("ci", "Ivory Coast", Africa),
    r("ke", "Kenya", Africa),
    r("ls", "Lesotho", Africa),
    r("lr", "Liberia", Africa),
    r("ly", "Libya", Africa),
    r("mg", "Madagascar", Africa),
    r("mw", "Malawi", Africa),
    r("ml", "Mali", Africa),
    r("mr", "Mauritania", Africa),
    r("mu", "Mauritius", Africa),
    r("ma", "Morocco", Africa),
    r("mz", "Mozambique", Africa),
    r("na", "Namibia", Africa),
    r("ne", "Niger", Africa),
    r("ng", "Nigeria", Africa),
    r("rw", "Rwanda", Africa),
    r("st", "Sao Tome and Principe", Africa),
    r("sn", "Senegal", Africa),
    r("sc", "Seychelles", Africa),
    r("sl", "Sierra Leone", Africa),
    r("so", "Somalia", Africa),
    r("za", "South Africa", Africa),
    r("ss", "South Sudan", Africa),
    r("sd", "Sudan", Africa),
    r("tz", "Tanzania", Africa),
    r("tg", "Togo", Africa),
    r("tn", "Tunisia", Africa),
    r("ug", "Uganda", Africa),
    r("zm", "Zambia", Africa),
    r("zw", "Zimbabwe", Africa),
    r("ag", "Antigua and Barbuda", NorthAmerica),
    r("bs", "Bahamas", NorthAmerica),
    r("bb", "Barbados", NorthAmerica),
    r("bz", "Belize", NorthAmerica),
    r("ca", "Canada", NorthAmerica),
    r("cr", "Costa Rica", NorthAmerica),
    r("cu", "Cuba", NorthAmerica),
    r("dm", "Dominica", NorthAmerica),
    r("do", "Dominican Republic", NorthAmerica),
    r("sv", "El Salvador", NorthAmerica),
    r("gd", "Grenada", NorthAmerica),
    r("gt", "Guatemala", NorthAmerica),
    r("ht", "Haiti", NorthAmerica),
    r("hn", "Honduras", NorthAmerica),
    r("jm", "Jamaica", NorthAmerica),
    r("mx", "Mexico", NorthAmerica),
    r("ni", "Nicaragua", NorthAmerica),
    r("pa", "Panama", NorthAmerica),
    r("kn", "Saint Kitts and Nevis", NorthAmerica),
    r("lc", "Saint Lucia", NorthAmerica),
    r("vc", "Saint Vincent and the Grenadines", NorthAmerica),
    r("tt", "Trinidad and Tobago", NorthAmerica),
    r("us", "United States", NorthAmerica),
    r("ar", "Argentina", SouthAmerica),
    r("bo", "Bolivia", SouthAmerica),
    r("br", "Brazil", SouthAmerica),
    r("cl", "Chile", SouthAmerica),
    r("co", "Colombia", SouthAmerica),
    r("ec", "Ecuador", SouthAmerica),
    r("gy", "Guyana", SouthAmerica),
    r("py", "Paraguay", SouthAmerica),
    r("pe", "Peru", SouthAmerica),
    r("sr", "Suriname", SouthAmerica),
    r("uy", "Uruguay", SouthAmerica),
    r("ve", "Venezuela", SouthAmerica),
    r("au", "Australia", Oceania),
    r("fj", "Fiji", Oceania),
    r("ki", "Kiribati", Oceania),
    r("mh", "Marshall Islands", Oceania),
    r("fm", "Micronesia", Oceania),
    r("nr", "Nauru", Oceania),
    r("nz", "New Zealand", Oceania),
    r("pw", "Palau", Oceania),
    r("pg", "Papua New Guinea", Oceania),
    r("ws", "Samoa", Oceania),
    r("sb", "Solomon Islands", Oceania),
    r("to", "Tonga", Oceania),
    r("tv", "Tuvalu", Oceania),
    r("vu", "Vanuatu", Oceania),
];

/// Canonical region id for a country or region code: trimmed, lower-case,
/// with ISO `gb` folded into `uk`.
pub fn normalize_id(code: &str) -> String {
    let id = code.trim().to_ascii_lowercase();
    match id.as_str() {
        "gb" => "uk".to_string(),
        _ => id,
    }
}

pub fn lookup(id: &str) -> Option<&'static RegionInfo> {
    let id = normalize_id(id);
    CATALOGUE.iter().find(|r| r.id == id)
}

pub fn is_known(id: &str) -> bool {
    lookup(id).is_some()
}

/// Human-readable name, falling back to the identifier itself.
pub fn display_name(id: &str) -> &str {
    lookup(id).map(|r| r.name).unwrap_or(id)
}

pub fn continent_of(id: &str) -> Option<Continent> {
    lookup(id).map(|r| r.continent)
}

pub fn regions_in(continent: Continent) -> impl Iterator<Item = &'static RegionInfo> {
    CATALOGUE.iter().filter(move |r| r.continent == continent)
}

/// Reference threshold the ladder below was written against.
pub const LADDER_BASELINE_MS: f64 = 200.0;

/// Ascending latency ceilings, each bound to one plausible region.
///
/// Not calibrated against anything; a coarse bucket of last resort.
const LATENCY_LADDER: &[(f64, &str)] = &[
    (30.0, "cn"),
    (50.0, "hk"),
    (60.0, "tw"),
    (70.0, "jp"),
    (80.0, "kr"),
    (90.0, "sg"),
    (100.0, "my"),
    (110.0, "th"),
    (120.0, "vn"),
    (130.0, "ph"),
    (150.0, "in"),
    (160.0, "au"),
    (170.0, "nz"),
    (180.0, "ae"),
    (190.0, "ru"),
    (200.0, "tr"),
    (210.0, "uk"),
    (220.0, "fr"),
    (230.0, "de"),
    (240.0, "nl"),
    (250.0, "it"),
    (260.0, "es"),
    (280.0, "us"),
    (290.0, "ca"),
    (300.0, "mx"),
    (320.0, "br"),
    (330.0, "ar"),
    (340.0, "cl"),
    (350.0, "za"),
    (360.0, "eg"),
    (370.0, "ng"),
];

/// Latency-ladder guess, with thresholds scaled by `max_latency_ms / 200`.
pub fn ladder_region(latency_ms: f64, max_latency_ms: f64) -> Option<&'static str> {
    if !latency_ms.is_finite() || max_latency_ms <= 0.0 {
        return None;
    }
    let scale = max_latency_ms / LADDER_BASELINE_MS;
    LATENCY_LADDER
        .iter()
        .find(|(ceiling, _)| latency_ms < ceiling * scale)
        .map(|&(_, region)| region)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pop_codes_map_case_insensitively() {
        assert_eq!(region_for_pop("SJC"), Some("us"));
        assert_eq!(region_for_pop("hkg"), Some("hk"));
        assert_eq!(region_for_pop("LHR"), Some("uk"));
        assert_eq!(region_for_pop("XXX"), None);
    }

    #[test]
    fn every_pop_region_is_in_catalogue() {
        for code in ["EWR", "YUL", "FRA", "NRT", "SYD", "GRU", "JNB", "DXB", "IST"] {
            let region = region_for_pop(code).unwrap();
            assert!(is_known(region), "{code} -> {region} missing");
        }
    }

    #[test]
    fn ladder_scales_with_threshold() {
        assert_eq!(ladder_region(25.0, 200.0), Some("cn"));
        assert_eq!(ladder_region(45.0, 200.0), Some("hk"));
        // doubling the threshold doubles every ceiling
        assert_eq!(ladder_region(45.0, 400.0), Some("cn"));
        assert_eq!(ladder_region(500.0, 200.0), None);
        assert_eq!(ladder_region(f64::INFINITY, 200.0), None);
    }

    #[test]
    fn continent_queries() {
        assert_eq!(continent_of("us"), Some(Continent::NorthAmerica));
        assert!(regions_in(Continent::Oceania).any(|r| r.id == "nz"));
        assert_eq!("north-america".parse::<Continent>().unwrap(), Continent::NorthAmerica);
        assert_eq!(display_name("zz"), "zz");
    }

    #[test]
    fn iso_gb_folds_into_uk() {
        assert_eq!(normalize_id(" GB "), "uk");
        assert_eq!(normalize_id("De"), "de");
        assert_eq!(continent_of("gb"), Some(Continent::Europe));
    }
}
