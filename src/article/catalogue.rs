//! Static brand and model catalogue for the Indian car and two-wheeler market.

use lazy_static::lazy_static;
use std::collections::BTreeSet;

pub struct Brand {
    /// Stable tag stored on articles.
    pub key: &'static str,
    /// Name used in published metadata.
    pub display: &'static str,
    /// Lowercase spellings that identify the brand in text.
    pub aliases: &'static [&'static str],
    pub models: &'static [&'static str],
}

const BRANDS: &[Brand] = &[
    Brand {
        key: "maruti",
        display: "Maruti Suzuki",
        aliases: &["maruti suzuki", "maruti"],
        models: &[
            "swift", "alto", "wagon r", "baleno", "vitara brezza", "brezza", "dzire", "ertiga",
            "ciaz", "s-cross", "xl6", "celerio", "ignis", "fronx", "jimny", "grand vitara",
        ],
    },
    Brand {
        key: "hyundai",
        display: "Hyundai",
        aliases: &["hyundai"],
        models: &[
            "i20", "creta", "verna", "venue", "grand i10", "santro", "tucson", "kona", "elantra",
            "sonata", "alcazar", "aura", "exter",
        ],
    },
    Brand {
        key: "tata",
        display: "Tata",
        aliases: &["tata motors", "tata"],
        models: &[
            "nexon", "harrier", "safari", "tigor", "tiago", "punch", "altroz", "bolt", "zest",
            "hexa", "curvv",
        ],
    },
    Brand {
        key: "mahindra",
        display: "Mahindra",
        aliases: &["mahindra"],
        models: &[
            "xuv700", "xuv300", "scorpio n", "scorpio", "thar", "bolero", "marazzo", "alturas",
            "kuv100", "xuv500", "xuv400",
        ],
    },
    Brand {
        key: "honda",
        display: "Honda",
        aliases: &["honda"],
        models: &["city", "amaze", "jazz", "wr-v", "civic", "cr-v", "pilot", "accord", "elevate"],
    },
    Brand {
        key: "toyota",
        display: "Toyota",
        aliases: &["toyota"],
        models: &[
            "innova", "fortuner", "etios", "corolla", "camry", "yaris", "glanza",
            "urban cruiser", "hyryder", "hilux",
        ],
    },
    Brand {
        key: "ford",
        display: "Ford",
        aliases: &["ford"],
        models: &["ecosport", "figo", "aspire", "freestyle", "endeavour", "mustang"],
    },
    Brand {
        key: "kia",
        display: "Kia",
        aliases: &["kia"],
        models: &["seltos", "sonet", "carnival", "carens", "ev6"],
    },
    Brand {
        key: "mg",
        display: "MG",
        aliases: &["mg motor", "mg"],
        models: &["hector", "zs ev", "gloster", "astor", "comet"],
    },
    Brand {
        key: "volkswagen",
        display: "Volkswagen",
        aliases: &["volkswagen", "vw"],
        models: &["polo", "vento", "ameo", "tiguan", "t-roc", "passat", "virtus", "taigun"],
    },
    Brand {
        key: "skoda",
        display: "Skoda",
        aliases: &["skoda"],
        models: &["rapid", "superb", "octavia", "kodiaq", "kushaq", "slavia"],
    },
    Brand {
        key: "renault",
        display: "Renault",
        aliases: &["renault"],
        models: &["kwid", "duster", "captur", "triber", "kiger"],
    },
    Brand {
        key: "nissan",
        display: "Nissan",
        aliases: &["nissan"],
        models: &["magnite", "kicks", "terrano", "micra", "sunny", "x-trail"],
    },
    Brand {
        key: "citroen",
        display: "Citroen",
        aliases: &["citroen"],
        models: &["c5 aircross", "c3 aircross", "ec3", "c3", "basalt"],
    },
    Brand {
        key: "jeep",
        display: "Jeep",
        aliases: &["jeep"],
        models: &["compass", "wrangler", "grand cherokee", "meridian"],
    },
    Brand {
        key: "tvs",
        display: "TVS",
        aliases: &["tvs"],
        models: &[
            "ntorq", "jupiter", "apache", "raider", "ronin", "iqube", "creon", "orbiter",
        ],
    },
    Brand {
        key: "hero",
        display: "Hero",
        aliases: &["hero motocorp", "hero"],
        models: &["splendor", "passion", "hf deluxe", "glamour", "xtreme", "xoom"],
    },
    Brand {
        key: "bajaj",
        display: "Bajaj",
        aliases: &["bajaj"],
        models: &["pulsar", "avenger", "dominar", "platina", "chetak"],
    },
    Brand {
        key: "royal enfield",
        display: "Royal Enfield",
        aliases: &["royal enfield"],
        models: &[
            "classic", "bullet", "thunderbird", "himalayan", "interceptor", "continental gt",
            "meteor", "hunter",
        ],
    },
    Brand {
        key: "yamaha",
        display: "Yamaha",
        aliases: &["yamaha"],
        models: &["fz", "mt", "r15", "fascino", "ray zr", "aerox"],
    },
    Brand {
        key: "ktm",
        display: "KTM",
        aliases: &["ktm"],
        models: &["duke", "rc", "adventure"],
    },
    Brand {
        key: "bmw",
        display: "BMW",
        aliases: &["bmw"],
        models: &[
            "3 series", "5 series", "7 series", "x1", "x3", "x5", "x7", "z4", "i4", "ix",
        ],
    },
    Brand {
        key: "mercedes",
        display: "Mercedes-Benz",
        aliases: &["mercedes-benz", "mercedes"],
        models: &[
            "a-class", "c-class", "e-class", "s-class", "gla", "glb", "glc", "gle", "gls", "eqc",
            "eqs",
        ],
    },
    Brand {
        key: "audi",
        display: "Audi",
        aliases: &["audi"],
        models: &[
            "a3", "a4", "a6", "a8", "q2", "q3", "q5", "q7", "q8", "tt", "r8", "e-tron",
        ],
    },
    Brand {
        key: "jaguar",
        display: "Jaguar",
        aliases: &["jaguar"],
        models: &["xe", "xf", "xj", "f-pace", "e-pace", "i-pace"],
    },
    Brand {
        key: "land rover",
        display: "Land Rover",
        aliases: &["land rover"],
        models: &["discovery", "range rover", "defender", "freelander", "evoque"],
    },
    Brand {
        key: "porsche",
        display: "Porsche",
        aliases: &["porsche"],
        models: &["911", "cayenne", "macan", "panamera", "boxster", "cayman", "taycan"],
    },
    Brand {
        key: "tesla",
        display: "Tesla",
        aliases: &["tesla"],
        models: &["model s", "model 3", "model x", "model y", "cybertruck"],
    },
];

lazy_static! {
    static ref CATALOGUE: Catalogue = Catalogue { brands: BRANDS };
}

/// Brand and model tags found in a piece of text.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Tags {
    pub brands: BTreeSet<String>,
    pub models: BTreeSet<String>,
}

pub struct Catalogue {
    brands: &'static [Brand],
}

impl Catalogue {
    pub fn global() -> &'static Catalogue {
        &CATALOGUE
    }

    pub fn brand(&self, key: &str) -> Option<&'static Brand> {
        self.brands.iter().find(|b| b.key == key)
    }

    /// Display name for a brand tag, falling back to the tag itself.
    pub fn display_name(&self, key: &str) -> String {
        self.brand(key)
            .map(|b| b.display.to_string())
            .unwrap_or_else(|| title_case(key))
    }

    /// Finds brand and model mentions. Models only count when their brand is
    /// also mentioned, so "city" alone never tags an article as a Honda story.
    pub fn extract(&self, text: &str) -> Tags {
        let haystack = format!(" {} ", match_form(text));
        let mut tags = Tags::default();

        for brand in self.brands {
            let mentioned = brand
                .aliases
                .iter()
                .any(|alias| haystack.contains(&format!(" {} ", alias)));
            if !mentioned {
                continue;
            }
            tags.brands.insert(brand.key.to_string());
            for model in brand.models {
                if haystack.contains(&format!(" {} ", model)) {
                    tags.models.insert(model.to_string());
                }
            }
        }

        tags
    }
}

/// Lowercases and replaces punctuation other than hyphens with spaces so that
/// catalogue phrases can be matched on word boundaries.
fn match_form(text: &str) -> String {
    let lowered: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { ' ' })
        .collect();
    lowered.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn title_case(value: &str) -> String {
    value
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
