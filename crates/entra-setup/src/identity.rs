use rand::{
    Rng,
    distr::{Alphanumeric, SampleString},
    seq::{IndexedRandom, SliceRandom},
};

use crate::graph::{Domain, NewApplication, NewUser, PasswordProfile};

const APP_SUFFIX_LEN: usize = 7;
const PASSWORD_BODY_LEN: usize = 20;
const PASSWORD_SYMBOLS: &[u8] = b"!#$%&*+-=?@^_~";

const FIRST_NAMES: &[&str] = &[
    "Alex", "Bailey", "Casey", "Dana", "Emerson", "Finley", "Gray", "Harper", "Jordan", "Kendall",
    "Logan", "Morgan", "Parker", "Quinn", "Riley", "Sawyer", "Taylor", "Avery",
];
const LAST_NAMES: &[&str] = &[
    "Abbott", "Barnes", "Carver", "Dalton", "Ellison", "Fletcher", "Garrett", "Holloway",
    "Ingram", "Jennings", "Keller", "Lambert", "Mercer", "Norris", "Prescott", "Ramsey",
    "Sutton", "Whitaker",
];

/// Source of plausible person names for synthetic users.
pub trait NameSource: Send + Sync {
    fn person_name(&mut self) -> String;
}

/// Picks first/last name pairs at random.
#[derive(Default)]
pub struct RandomNames;

impl NameSource for RandomNames {
    fn person_name(&mut self) -> String {
        let mut rng = rand::rng();
        let first = FIRST_NAMES.choose(&mut rng).copied().unwrap_or("Alex");
        let last = LAST_NAMES.choose(&mut rng).copied().unwrap_or("Abbott");
        format!("{first} {last}")
    }
}

/// A user payload together with the password it was created with, which the
/// operator needs for the first sign-in.
#[derive(Clone, Debug)]
pub struct UserBlueprint {
    pub user: NewUser,
    pub initial_password: String,
}

/// Builds payloads for new directory objects, tagging every display name so
/// staged objects are recognisable in the tenant.
pub struct IdentityFactory {
    names: Box<dyn NameSource>,
    tag: String,
}

impl IdentityFactory {
    pub fn new(tag: impl Into<String>) -> Self {
        Self::with_names(tag, Box::new(RandomNames))
    }

    pub fn with_names(tag: impl Into<String>, names: Box<dyn NameSource>) -> Self {
        Self {
            names,
            tag: tag.into(),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    fn tagged(&self, name: &str) -> String {
        if self.tag.is_empty() {
            name.to_string()
        } else {
            format!("{name} {}", self.tag)
        }
    }

    pub fn new_application(&self) -> NewApplication {
        let suffix = Alphanumeric
            .sample_string(&mut rand::rng(), APP_SUFFIX_LEN)
            .to_ascii_lowercase();
        NewApplication {
            display_name: self.tagged(&format!("Test App {suffix}")),
            sign_in_audience: None,
        }
    }

    pub fn new_user(&mut self, domain: &str) -> UserBlueprint {
        let name = self.names.person_name();
        let mail_nickname: String = name.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
        let password = generate_password();
        let user = NewUser {
            account_enabled: true,
            display_name: self.tagged(&name),
            user_principal_name: format!("{}@{domain}", mail_nickname.to_ascii_lowercase()),
            mail_nickname,
            password_profile: PasswordProfile {
                force_change_password_next_sign_in: true,
                password: password.clone(),
            },
        };
        UserBlueprint {
            user,
            initial_password: password,
        }
    }
}

/// Chooses the tenant's default domain, falling back to the first one listed.
pub fn pick_domain(domains: &[Domain]) -> Option<&str> {
    domains
        .iter()
        .find(|domain| domain.is_default)
        .or_else(|| domains.first())
        .map(|domain| domain.id.as_str())
}

/// Random password containing upper, lower, digit and symbol characters.
pub fn generate_password() -> String {
    let mut rng = rand::rng();
    let mut chars: Vec<char> = Alphanumeric
        .sample_string(&mut rng, PASSWORD_BODY_LEN)
        .chars()
        .collect();
    chars.push(rng.random_range('A'..='Z'));
    chars.push(rng.random_range('a'..='z'));
    chars.push(rng.random_range('0'..='9'));
    chars.push(*PASSWORD_SYMBOLS.choose(&mut rng).unwrap_or(&b'!') as char);
    chars.shuffle(&mut rng);
    chars.into_iter().collect()
}
