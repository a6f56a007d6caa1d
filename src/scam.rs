// src/scam.rs
//! Scam scoring – ocena treści wiadomości niezależna od historii użytkownika.
//!
//! Etapy: normalizacja → frazy (3 progi wag) → URL-e wg polityki grupy →
//! socjotechnika (pilność, emoji, CAPS, podszywanie się pod support) →
//! odliczenia chroniące przed fałszywymi alarmami → clamp 0..100.
//! Silnik tylko ocenia; akcję wykonuje dispatcher.

use std::collections::BTreeSet;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;
use url::Url;

use crate::model::{ChatId, UserId};
use crate::moderation::{Severity, determine_severity};
use crate::permissions::Trust;

/// Polityka scam grupy = domyślne z konfiguracji nadpisane wpisem z group_config.
pub type ScamPolicy = crate::config::ScamDefaults;

/* ==============================
   Polityka
   ============================== */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScamAction {
    #[default]
    Delete,
    Warn,
    Restrict,
    Kick,
    Ban,
    /// Dobór wg wyniku i historii (determine_severity).
    Auto,
}

impl ScamAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScamAction::Delete => "delete",
            ScamAction::Warn => "warn",
            ScamAction::Restrict => "restrict",
            ScamAction::Kick => "kick",
            ScamAction::Ban => "ban",
            ScamAction::Auto => "auto",
        }
    }

    /// delete/warn → SOFT, restrict/kick → MEDIUM, ban → HARD, auto → wg wyniku.
    pub fn severity(
        &self,
        score: u8,
        reasons: &[String],
        is_repeated: bool,
        multiple_groups: bool,
    ) -> Severity {
        match self {
            ScamAction::Delete | ScamAction::Warn => Severity::Soft,
            ScamAction::Restrict | ScamAction::Kick => Severity::Medium,
            ScamAction::Ban => Severity::Hard,
            ScamAction::Auto => {
                determine_severity(score as i32, reasons, is_repeated, multiple_groups)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UrlPolicy {
    #[default]
    Allow,
    Allowlist,
    BlockAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScamSeverity {
    Low,
    Medium,
    High,
}

impl ScamSeverity {
    pub fn from_score(score: u8) -> Self {
        if score >= 18 {
            ScamSeverity::High
        } else if score >= 10 {
            ScamSeverity::Medium
        } else {
            ScamSeverity::Low
        }
    }
}

/* ==============================
   Wagi
   ============================== */

const W_HIGH: i32 = 10;
const W_MEDIUM: i32 = 6;
const W_LOW: i32 = 3;
const W_SHORTENER: i32 = 10;
const W_INVITE: i32 = 10;
const W_NOT_ALLOWLISTED: i32 = 15;
const W_BLOCK_ALL: i32 = 25;
const W_URGENCY: i32 = 15;
const W_EMOJI_WITH_URL: i32 = 10;
const W_CAPS_WITH_URL: i32 = 8;
const W_SUSPICIOUS_HANDLE: i32 = 12;
const D_SHORT_NO_URL: i32 = -5;
const D_REPLY_TO_TRUSTED: i32 = -10;

const EMOJI_MIN: usize = 5;
const CAPS_MIN_LETTERS: usize = 10;
const CAPS_RATIO: f32 = 0.6;
const SHORT_MESSAGE_CHARS: usize = 20;

fn compile(tier: &[(&'static str, &'static str)]) -> Vec<(&'static str, Regex)> {
    tier.iter()
        .filter_map(|(name, pat)| Regex::new(pat).ok().map(|re| (*name, re)))
        .collect()
}

static HIGH_PHRASES: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    compile(&[
        ("verify_account", r"\bverify (?:your )?(?:account|wallet|identity)\b"),
        ("account_suspended", r"\baccount (?:has been |will be |is )?(?:suspended|locked|restricted|disabled|closed)\b"),
        ("support_impersonation", r"\b(?:official )?(?:support|help) ?(?:team|desk|center|centre)\b"),
        ("seed_phrase", r"\b(?:seed|recovery|secret) phrase\b"),
        ("wallet_connect", r"\b(?:connect|sync|validate) (?:your )?wallet\b|\bwallet ?connect\b"),
        ("claim_airdrop", r"\bclaim (?:your )?(?:airdrop|reward|prize|tokens?)\b"),
        ("double_crypto", r"\bdouble (?:your )?(?:crypto|bitcoin|btc|eth|usdt|money|investment)\b"),
    ])
});

static MEDIUM_PHRASES: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    compile(&[
        ("dm_me", r"\b(?:dm|pm|inbox|message) me\b"),
        ("investment_offer", r"\binvestment (?:opportunity|plan|platform)\b"),
        ("guaranteed_profit", r"\bguaranteed (?:profits?|returns?|income)\b"),
        ("free_crypto", r"\bfree (?:crypto|bitcoin|btc|usdt|eth|nft)s?\b"),
        ("click_link", r"\bclick (?:the |this |my )?link\b"),
        ("limited_offer", r"\blimited (?:time|offer|spots?)\b"),
        ("earn_daily", r"\bearn \$?\d+[k]? ?(?:daily|per day|a day|weekly)\b"),
        ("private_key", r"\bprivate key\b"),
    ])
});

static LOW_PHRASES: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    compile(&[
        ("crypto", r"\bcrypto(?:currency)?\b"),
        ("coin_ticker", r"\b(?:bitcoin|btc|usdt|eth)\b"),
        ("profit", r"\bprofits?\b"),
        ("giveaway", r"\bgiveaway\b"),
        ("bonus", r"\bbonus\b"),
        ("forex", r"\bforex\b"),
        ("trading_signals", r"\btrading signals?\b"),
        ("wallet", r"\bwallet\b"),
    ])
});

static URGENCY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:urgent(?:ly)?|immediately|act now|right now|asap|last chance|within 24 ?h(?:ours)?|expires? (?:today|soon))\b")
        .unwrap()
});

static BARE_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:https?://)?(?:[a-z0-9](?:[a-z0-9-]*[a-z0-9])?\.)+[a-z]{2,24}(?::\d+)?(?:/[^\s]*)?")
        .unwrap()
});

static HANDLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"@([a-z0-9_]{3,32})").unwrap());

static SUSPICIOUS_HANDLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"admin|support|official|helpdesk|moderator|service|verify|security").unwrap()
});

const SHORTENERS: &[&str] = &[
    "bit.ly", "tinyurl.com", "t.co", "goo.gl", "is.gd", "cutt.ly", "ow.ly", "rebrand.ly",
    "shorturl.at", "rb.gy", "tiny.cc", "buff.ly", "s.id", "v.gd",
];

/// (host, prefiks ścieżki) zaproszeń do innych czatów.
const INVITES: &[(&str, &str)] = &[
    ("t.me", "/+"),
    ("t.me", "/joinchat"),
    ("telegram.me", "/joinchat"),
    ("discord.gg", "/"),
    ("discord.com", "/invite"),
    ("discordapp.com", "/invite"),
    ("chat.whatsapp.com", "/"),
];

/* ==============================
   Normalizacja
   ============================== */

/// Case-fold, NFKC, bez znaków zerowej szerokości, homoglify → łacinka, zwinięte spacje.
pub fn normalize(text: &str) -> String {
    let folded = text.nfkc().collect::<String>().to_lowercase();
    let mut out = String::with_capacity(folded.len());
    let mut last_space = true;
    for ch in folded.chars() {
        if is_zero_width(ch) {
            continue;
        }
        if ch.is_whitespace() {
            if !last_space {
                out.push(' ');
                last_space = true;
            }
            continue;
        }
        out.push(map_confusable(ch).unwrap_or(ch));
        last_space = false;
    }
    if out.ends_with(' ') {
        out.pop();
    }
    out
}

fn is_zero_width(ch: char) -> bool {
    matches!(
        ch,
        '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{FEFF}' | '\u{00AD}'
    )
}

fn map_confusable(ch: char) -> Option<char> {
    match ch {
        // Cyrillic
        '\u{0430}' => Some('a'),
        '\u{0435}' => Some('e'),
        '\u{043E}' => Some('o'),
        '\u{0440}' => Some('p'),
        '\u{0441}' => Some('c'),
        '\u{0445}' => Some('x'),
        '\u{0443}' => Some('y'),
        '\u{0456}' => Some('i'),
        '\u{04CF}' => Some('l'),
        // Greek
        '\u{03b1}' => Some('a'),
        '\u{03b5}' => Some('e'),
        '\u{03bf}' => Some('o'),
        '\u{03c1}' => Some('p'),
        '\u{03c5}' => Some('y'),
        '\u{03ba}' => Some('k'),
        '\u{03bd}' => Some('v'),
        _ => None,
    }
}

/* ==============================
   URL-e
   ============================== */

/// URL-e z encji + "gołe" domeny z tekstu (np. `bit.ly/xyz`), bez duplikatów.
pub fn extract_urls(normalized: &str, entity_urls: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    let mut push = |u: &str| {
        let u = u.trim_end_matches(['.', ',', ')', '!', '?', ';', ':']);
        if !u.is_empty() && seen.insert(u.to_lowercase()) {
            out.push(u.to_string());
        }
    };
    for u in entity_urls {
        push(u);
    }
    for m in BARE_URL.find_iter(normalized) {
        // e-mail, nie URL
        if normalized[..m.start()].ends_with('@') {
            continue;
        }
        push(m.as_str());
    }
    out
}

fn parse_url(raw: &str) -> Option<Url> {
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{raw}")
    };
    Url::parse(&with_scheme).ok()
}

fn host_of(url: &Url) -> Option<String> {
    url.host_str()
        .map(|h| h.trim_start_matches("www.").to_ascii_lowercase())
}

fn host_matches(host: &str, domain: &str) -> bool {
    let domain = domain.trim().trim_start_matches("www.").to_ascii_lowercase();
    !domain.is_empty() && (host == domain || host.ends_with(&format!(".{domain}")))
}

fn is_shortener(host: &str) -> bool {
    SHORTENERS.iter().any(|s| host == *s)
}

fn is_invite(host: &str, path: &str) -> bool {
    INVITES
        .iter()
        .any(|(h, prefix)| host == *h && path.starts_with(prefix) && path.len() > prefix.len())
}

/* ==============================
   Wynik
   ============================== */

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContentScore {
    pub score: u8,
    pub reasons: Vec<String>,
    pub severity: ScamSeverity,
}

/// Kontekst jednej wiadomości.
#[derive(Debug, Clone, Copy)]
pub struct ScamContext<'a> {
    pub user_id: UserId,
    pub chat_id: ChatId,
    pub text: &'a str,
    pub entity_urls: &'a [String],
    pub mentions: &'a [String],
    pub reply_to_user_id: Option<UserId>,
    pub policy: &'a ScamPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScamResult {
    pub score: u8,
    pub severity: ScamSeverity,
    pub reasons: Vec<String>,
    pub should_act: bool,
    pub action: ScamAction,
    pub exempt: bool,
}

pub struct ScamEngine {
    trust: Arc<Trust>,
}

impl ScamEngine {
    pub fn new(trust: Arc<Trust>) -> Self {
        Self { trust }
    }

    /// Czysta ocena treści. `reply_to` to adresat odpowiedzi (jeśli wiadomość jest odpowiedzią).
    pub fn score_content(
        &self,
        text: &str,
        entity_urls: &[String],
        mentions: &[String],
        reply_to: Option<UserId>,
        policy: &ScamPolicy,
    ) -> ContentScore {
        let norm = normalize(text);
        let urls = extract_urls(&norm, entity_urls);
        let mut score: i32 = 0;
        let mut reasons = Vec::new();

        // frazy
        for (tier, weight, label) in [
            (&*HIGH_PHRASES, W_HIGH, "high"),
            (&*MEDIUM_PHRASES, W_MEDIUM, "medium"),
            (&*LOW_PHRASES, W_LOW, "low"),
        ] {
            for (name, re) in tier {
                if re.is_match(&norm) {
                    score += weight;
                    reasons.push(format!("phrase_{label}:{name}"));
                }
            }
        }

        // URL-e
        for raw in &urls {
            let Some(parsed) = parse_url(raw) else {
                continue;
            };
            let Some(host) = host_of(&parsed) else {
                continue;
            };
            if is_shortener(&host) {
                score += W_SHORTENER;
                reasons.push(format!("shortener:{host}"));
            }
            if is_invite(&host, parsed.path()) {
                score += W_INVITE;
                reasons.push(format!("invite_link:{host}"));
            }
            match policy.url_policy {
                UrlPolicy::Allow => {}
                UrlPolicy::Allowlist => {
                    if !policy.allowlist.iter().any(|d| host_matches(&host, d)) {
                        score += W_NOT_ALLOWLISTED;
                        reasons.push(format!("url_not_allowlisted:{host}"));
                    }
                }
                UrlPolicy::BlockAll => {
                    score += W_BLOCK_ALL;
                    reasons.push(format!("url_blocked:{host}"));
                }
            }
        }
        let has_url = !urls.is_empty();

        // socjotechnika
        if URGENCY.is_match(&norm) {
            score += W_URGENCY;
            reasons.push("urgency".into());
        }
        if has_url && count_emoji(text) >= EMOJI_MIN {
            score += W_EMOJI_WITH_URL;
            reasons.push("emoji_with_url".into());
        }
        if has_url && caps_ratio(text).is_some_and(|r| r > CAPS_RATIO) {
            score += W_CAPS_WITH_URL;
            reasons.push("caps_with_url".into());
        }
        if let Some(handle) = suspicious_handle(&norm, mentions) {
            score += W_SUSPICIOUS_HANDLE;
            reasons.push(format!("suspicious_handle:{handle}"));
        }

        // odliczenia
        if !has_url && norm.chars().count() < SHORT_MESSAGE_CHARS {
            score += D_SHORT_NO_URL;
            reasons.push("short_message".into());
        }
        if reply_to.is_some_and(|u| self.trust.is_exempt(u)) {
            score += D_REPLY_TO_TRUSTED;
            reasons.push("reply_to_trusted".into());
        }

        let score = score.clamp(0, 100) as u8;
        ContentScore {
            score,
            severity: ScamSeverity::from_score(score),
            reasons,
        }
    }

    /// Ocena z polityką grupy: admin/zespół zawsze 0 i brak akcji.
    pub fn evaluate(&self, ctx: &ScamContext<'_>) -> ScamResult {
        if self.trust.is_exempt(ctx.user_id) {
            return ScamResult {
                score: 0,
                severity: ScamSeverity::Low,
                reasons: vec!["exempt".into()],
                should_act: false,
                action: ctx.policy.action,
                exempt: true,
            };
        }

        let c = self.score_content(
            ctx.text,
            ctx.entity_urls,
            ctx.mentions,
            ctx.reply_to_user_id,
            ctx.policy,
        );
        let should_act = ctx.policy.enabled && c.score >= ctx.policy.threshold;
        ScamResult {
            score: c.score,
            severity: c.severity,
            reasons: c.reasons,
            should_act,
            action: ctx.policy.action,
            exempt: false,
        }
    }
}

fn count_emoji(text: &str) -> usize {
    text.chars()
        .filter(|c| {
            matches!(*c as u32,
                0x1F300..=0x1FAFF | 0x2600..=0x27BF | 0x1F1E6..=0x1F1FF | 0x1F000..=0x1F2FF)
        })
        .count()
}

/// `None`, gdy liter jest za mało, by mówić o krzyczeniu.
fn caps_ratio(text: &str) -> Option<f32> {
    let (mut letters, mut upper) = (0usize, 0usize);
    for c in text.chars().filter(|c| c.is_alphabetic()) {
        letters += 1;
        if c.is_uppercase() {
            upper += 1;
        }
    }
    (letters >= CAPS_MIN_LETTERS).then(|| upper as f32 / letters as f32)
}

fn suspicious_handle(norm: &str, mentions: &[String]) -> Option<String> {
    let from_text = HANDLE.captures_iter(norm).map(|c| c[1].to_string());
    let from_entities = mentions
        .iter()
        .map(|m| normalize(m).trim_start_matches('@').to_string());
    from_entities
        .chain(from_text)
        .find(|h| SUSPICIOUS_HANDLE.is_match(h))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn engine() -> ScamEngine {
        ScamEngine::new(Arc::new(Trust::new([1], vec![])))
    }

    fn ctx<'a>(user_id: UserId, text: &'a str, policy: &'a ScamPolicy) -> ScamContext<'a> {
        ScamContext {
            user_id,
            chat_id: -100,
            text,
            entity_urls: &[],
            mentions: &[],
            reply_to_user_id: None,
            policy,
        }
    }

    #[test]
    fn normalize_folds_homoglyphs_and_zero_width() {
        // "раураl" – cyrylica
        assert_eq!(normalize("р\u{200B}ауРаl   Support"), "paypal support");
    }

    #[test]
    fn bare_domains_are_extracted() {
        let urls = extract_urls("go to bit.ly/xyz, or mail me@example.com", &[]);
        assert_eq!(urls, vec!["bit.ly/xyz".to_string()]);
    }

    #[test]
    fn urgent_support_shortener_message_is_high() {
        let policy = ScamPolicy::default();
        let r = engine().evaluate(&ctx(
            500,
            "URGENT: verify your account now, official support team: bit.ly/xyz",
            &policy,
        ));
        assert!(r.score >= 45, "score {} reasons {:?}", r.score, r.reasons);
        assert_eq!(r.severity, ScamSeverity::High);
        assert!(r.reasons.iter().any(|x| x == "urgency"));
        assert!(r.reasons.iter().any(|x| x == "shortener:bit.ly"));
        assert!(!r.should_act, "default threshold 70 not reached");
    }

    #[test]
    fn allowlist_accepts_subdomains_only_of_listed_domains() {
        let policy = ScamPolicy {
            url_policy: UrlPolicy::Allowlist,
            allowlist: vec!["example.org".into()],
            ..ScamPolicy::default()
        };
        let e = engine();
        let ok = e.score_content("see https://docs.example.org/a", &[], &[], None, &policy);
        assert!(!ok.reasons.iter().any(|r| r.starts_with("url_not_allowlisted")));
        let bad = e.score_content("see https://example.org.evil.io/a", &[], &[], None, &policy);
        assert!(bad.reasons.iter().any(|r| r.starts_with("url_not_allowlisted")));
    }

    #[test]
    fn invite_links_count_under_allow_policy() {
        let policy = ScamPolicy::default();
        let r = engine().score_content("join t.me/+AbCdEf quickly", &[], &[], None, &policy);
        assert!(r.reasons.iter().any(|x| x == "invite_link:t.me"));
    }

    #[test]
    fn reply_to_admin_and_short_text_reduce_score() {
        let policy = ScamPolicy::default();
        let r = engine().score_content("thanks, wallet ok", &[], &[], Some(1), &policy);
        assert_eq!(r.score, 0);
        assert!(r.reasons.contains(&"short_message".to_string()));
        assert!(r.reasons.contains(&"reply_to_trusted".to_string()));
    }

    #[test]
    fn auto_action_uses_determine_severity() {
        assert_eq!(ScamAction::Auto.severity(30, &[], false, false), Severity::Hard);
        assert_eq!(ScamAction::Auto.severity(12, &[], false, false), Severity::Medium);
        assert_eq!(ScamAction::Warn.severity(90, &[], true, true), Severity::Soft);
        assert_eq!(ScamAction::Kick.severity(0, &[], false, false), Severity::Medium);
    }

    proptest! {
        #[test]
        fn trusted_users_always_score_zero(text in ".{0,200}") {
            let policy = ScamPolicy { url_policy: UrlPolicy::BlockAll, threshold: 0, ..ScamPolicy::default() };
            let r = engine().evaluate(&ctx(1, &text, &policy));
            prop_assert_eq!(r.score, 0);
            prop_assert_eq!(r.severity, ScamSeverity::Low);
            prop_assert!(!r.should_act);
        }

        #[test]
        fn score_stays_in_range(text in ".{0,300}") {
            let policy = ScamPolicy { url_policy: UrlPolicy::BlockAll, ..ScamPolicy::default() };
            let r = engine().score_content(&text, &[], &[], None, &policy);
            prop_assert!(r.score <= 100);
        }
    }
}
