use crate::models::{ClinicalFlag, DailyValue, Entity, JournalEntry, JournalInsights, SentimentLabel};
use chrono::{Datelike, Duration, NaiveDate};
use std::collections::{BTreeMap, HashMap, HashSet};

const CLINICAL_KEYWORDS: &[(&str, &[&str])] = &[
    (
        "mental_health",
        &[
            "depression", "anxiety", "panic", "suicide", "self-harm",
            "hopeless", "worthless", "overwhelming", "can't cope",
        ],
    ),
    (
        "pain",
        &[
            "severe pain", "unbearable", "excruciating", "constant pain",
            "sharp pain", "burning pain", "chronic pain",
        ],
    ),
    (
        "emergency",
        &[
            "emergency", "urgent", "can't breathe", "chest pain",
            "heart attack", "stroke", "bleeding", "unconscious",
        ],
    ),
    (
        "substance",
        &[
            "alcohol", "drugs", "overdose", "addiction", "withdrawal",
            "relapse", "drinking", "high", "intoxicated",
        ],
    ),
];

const HIGH_SEVERITY: &[&str] = &[
    "suicide", "self-harm", "emergency", "can't breathe",
    "chest pain", "heart attack", "stroke", "overdose",
];

const MEDIUM_SEVERITY: &[&str] = &[
    "severe pain", "unbearable", "depression", "panic", "hopeless", "overwhelming",
];

const TOPIC_KEYWORDS: &[(&str, &[&str])] = &[
    (
        "mental_health",
        &[
            "anxiety", "depression", "stress", "mood", "emotional",
            "therapy", "counseling", "psychiatrist", "medication",
        ],
    ),
    (
        "physical_health",
        &[
            "pain", "symptoms", "doctor", "hospital", "treatment",
            "medication", "surgery", "diagnosis", "test", "exam",
        ],
    ),
    (
        "lifestyle",
        &[
            "exercise", "diet", "sleep", "nutrition", "fitness",
            "workout", "food", "eating", "weight", "activity",
        ],
    ),
    (
        "relationships",
        &[
            "family", "friends", "partner", "spouse", "relationship",
            "social", "support", "love", "conflict", "communication",
        ],
    ),
    (
        "work",
        &[
            "job", "work", "career", "boss", "colleague", "office",
            "stress", "deadline", "meeting", "project", "business",
        ],
    ),
];

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for",
    "of", "with", "by", "is", "are", "was", "were", "be", "been", "have",
    "has", "had", "do", "does", "did", "will", "would", "could", "should",
    "may", "might", "can", "cant", "i", "me", "my", "myself", "we", "our",
    "ours", "ourselves", "you", "your", "yours", "yourself", "yourselves",
    "he", "him", "his", "himself", "she", "her", "hers", "herself", "it",
    "its", "itself", "they", "them", "their", "theirs", "themselves",
];

/// Word polarity in -1..1.
const LEXICON: &[(&str, f64)] = &[
    ("good", 0.7), ("great", 0.8), ("happy", 0.8), ("better", 0.5),
    ("best", 1.0), ("calm", 0.3), ("grateful", 0.8), ("thankful", 0.6),
    ("love", 0.5), ("loved", 0.7), ("excellent", 1.0), ("wonderful", 1.0),
    ("amazing", 0.6), ("relaxed", 0.4), ("hopeful", 0.5), ("energetic", 0.4),
    ("proud", 0.8), ("enjoy", 0.4), ("enjoyed", 0.4), ("fine", 0.4),
    ("nice", 0.6), ("peaceful", 0.5), ("rested", 0.4), ("strong", 0.4),
    ("improving", 0.4), ("improved", 0.4), ("glad", 0.5), ("fun", 0.3),
    ("bad", -0.7), ("terrible", -1.0), ("awful", -1.0), ("horrible", -1.0),
    ("sad", -0.5), ("anxious", -0.5), ("depressed", -0.6), ("worse", -0.4),
    ("worst", -1.0), ("hopeless", -0.8), ("worthless", -0.8), ("tired", -0.4),
    ("lonely", -0.5), ("angry", -0.5), ("scared", -0.6), ("afraid", -0.6),
    ("miserable", -1.0), ("overwhelming", -0.4), ("overwhelmed", -0.5),
    ("unbearable", -0.8), ("exhausted", -0.5), ("stressed", -0.4),
    ("worried", -0.4), ("upset", -0.5), ("painful", -0.7), ("sick", -0.7),
    ("hurt", -0.5), ("frustrated", -0.6), ("crying", -0.5), ("weak", -0.4),
];

const NEGATIONS: &[&str] = &["not", "no", "never", "cannot", "without", "hardly"];

/// Polarity multiplier applied to a word following a negation.
const NEGATION_FACTOR: f64 = -0.5;
const NEGATION_WINDOW: usize = 3;

const ENTITY_DICTIONARY: &[(&str, &[&str], &str)] = &[
    (
        "MEDICATION",
        &[
            "ibuprofen", "acetaminophen", "tylenol", "aspirin", "advil", "insulin",
            "metformin", "sertraline", "prozac", "xanax", "lisinopril", "albuterol",
            "antibiotics", "melatonin",
        ],
        "Medication or drug",
    ),
    (
        "BODY_PART",
        &[
            "head", "back", "chest", "stomach", "knee", "neck", "shoulder",
            "throat", "leg", "arm", "foot", "hip", "wrist", "ankle",
        ],
        "Part of the body",
    ),
    (
        "SYMPTOM",
        &[
            "headache", "nausea", "fever", "cough", "dizziness", "fatigue",
            "insomnia", "migraine", "cramps", "rash", "vomiting", "shortness",
        ],
        "Symptom or clinical finding",
    ),
];

const TIME_WORDS: &[&str] = &[
    "Monday", "Tuesday", "Wednesday", "Thursday", "Friday", "Saturday", "Sunday",
    "January", "February", "March", "April", "May", "June", "July", "August",
    "September", "October", "November", "December",
];

/// Everything the analyzer writes back onto a journal entry.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryAnalysis {
    pub sentiment_score: Option<f64>,
    pub sentiment_label: SentimentLabel,
    pub keywords: Vec<String>,
    pub entities: Vec<Entity>,
    pub topics: Vec<String>,
    pub urgency_score: f64,
    pub clinical_flags: Vec<ClinicalFlag>,
}

impl Default for EntryAnalysis {
    fn default() -> Self {
        Self {
            sentiment_score: None,
            sentiment_label: SentimentLabel::Neutral,
            keywords: Vec::new(),
            entities: Vec::new(),
            topics: Vec::new(),
            urgency_score: 0.0,
            clinical_flags: Vec::new(),
        }
    }
}

fn normalize(text: &str) -> String {
    text.replace(['\u{2019}', '\u{2018}'], "'").to_lowercase()
}

fn strip_punctuation(word: &str) -> &str {
    word.trim_matches(|c: char| ".,!?\";:()[]{}".contains(c))
}

fn is_negation(word: &str) -> bool {
    NEGATIONS.contains(&word) || word.ends_with("n't")
}

/// Deterministic keyword and lexicon based text analysis for journal entries.
#[derive(Debug, Default, Clone)]
pub struct NlpService;

impl NlpService {
    pub fn new() -> Self {
        Self
    }

    pub fn analyze_entry(&self, entry: &JournalEntry) -> EntryAnalysis {
        self.analyze(&entry.content, entry.mood_rating, entry.pain_level)
    }

    pub fn analyze(&self, content: &str, mood_rating: Option<i32>, pain_level: Option<i32>) -> EntryAnalysis {
        if content.trim().is_empty() {
            return EntryAnalysis::default();
        }

        let text = normalize(content);
        let (score, label) = self.sentiment(&text);
        let (clinical_flags, urgency_score) = self.clinical_flags(&text, mood_rating, pain_level, score);

        EntryAnalysis {
            sentiment_score: Some(score),
            sentiment_label: label,
            keywords: self.keywords(&text),
            entities: self.entities(content),
            topics: self.topics(&text),
            urgency_score,
            clinical_flags,
        }
    }

    /// Mean polarity of lexicon words, with a preceding negation flipping
    /// and damping the word. Clamped to -1..1.
    pub fn sentiment(&self, text: &str) -> (f64, SentimentLabel) {
        let lexicon: HashMap<&str, f64> = LEXICON.iter().copied().collect();
        let words: Vec<&str> = text.split_whitespace().map(strip_punctuation).collect();

        let mut total = 0.0;
        let mut matched = 0usize;
        let mut last_negation: Option<usize> = None;

        for (i, word) in words.iter().enumerate() {
            if is_negation(word) {
                last_negation = Some(i);
                continue;
            }
            if let Some(&polarity) = lexicon.get(word) {
                let negated = last_negation.map(|n| i - n <= NEGATION_WINDOW).unwrap_or(false);
                total += if negated { polarity * NEGATION_FACTOR } else { polarity };
                matched += 1;
                last_negation = None;
            }
        }

        let score = if matched == 0 {
            0.0
        } else {
            (total / matched as f64).clamp(-1.0, 1.0)
        };

        let label = if score > 0.1 {
            SentimentLabel::Positive
        } else if score < -0.1 {
            SentimentLabel::Negative
        } else {
            SentimentLabel::Neutral
        };

        (score, label)
    }

    /// Top 10 non-stop-word tokens longer than three characters, most
    /// frequent first. Ties keep first-appearance order.
    pub fn keywords(&self, text: &str) -> Vec<String> {
        let mut order: Vec<(String, usize)> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for raw in text.split_whitespace() {
            let word = strip_punctuation(raw).to_lowercase();
            if word.chars().count() <= 3 || STOP_WORDS.contains(&word.as_str()) {
                continue;
            }
            match index.get(&word) {
                Some(&i) => order[i].1 += 1,
                None => {
                    index.insert(word.clone(), order.len());
                    order.push((word, 1));
                }
            }
        }

        // stable sort keeps first-appearance order among equal counts
        order.sort_by(|a, b| b.1.cmp(&a.1));
        order.into_iter().take(10).map(|(w, _)| w).collect()
    }

    /// Dictionary entities plus capitalised weekday and month names.
    pub fn entities(&self, original: &str) -> Vec<Entity> {
        let mut seen: HashSet<(String, &'static str)> = HashSet::new();
        let mut out = Vec::new();

        for raw in original.split_whitespace() {
            let word = strip_punctuation(raw);
            if word.is_empty() {
                continue;
            }
            let lower = word.to_lowercase();

            let hit = ENTITY_DICTIONARY
                .iter()
                .find(|(_, words, _)| words.contains(&lower.as_str()))
                .map(|(label, _, description)| (*label, *description))
                .or_else(|| {
                    TIME_WORDS
                        .contains(&word)
                        .then_some(("DATE", "Absolute or relative dates or periods"))
                });

            if let Some((label, description)) = hit {
                if seen.insert((lower, label)) {
                    out.push(Entity {
                        text: word.to_string(),
                        label: label.to_string(),
                        description: description.to_string(),
                    });
                }
            }
        }

        out
    }

    pub fn topics(&self, text: &str) -> Vec<String> {
        TOPIC_KEYWORDS
            .iter()
            .filter(|(_, keywords)| keywords.iter().any(|k| text.contains(k)))
            .map(|(topic, _)| topic.to_string())
            .collect()
    }

    pub fn keyword_severity(keyword: &str) -> f64 {
        if HIGH_SEVERITY.contains(&keyword) {
            0.9
        } else if MEDIUM_SEVERITY.contains(&keyword) {
            0.7
        } else {
            0.4
        }
    }

    /// Returns the flags and the urgency score (max severity, capped at 1).
    pub fn clinical_flags(
        &self,
        text: &str,
        mood_rating: Option<i32>,
        pain_level: Option<i32>,
        sentiment: f64,
    ) -> (Vec<ClinicalFlag>, f64) {
        let mut flags = Vec::new();

        for (category, keywords) in CLINICAL_KEYWORDS {
            for keyword in keywords.iter().filter(|k| text.contains(*k)) {
                flags.push(ClinicalFlag {
                    category: category.to_string(),
                    keyword: keyword.to_string(),
                    severity: Self::keyword_severity(keyword),
                });
            }
        }

        if mood_rating.map(|m| m <= 2).unwrap_or(false) {
            flags.push(ClinicalFlag {
                category: "mood".into(),
                keyword: "low_mood_rating".into(),
                severity: 0.6,
            });
        }

        if pain_level.map(|p| p >= 8).unwrap_or(false) {
            flags.push(ClinicalFlag {
                category: "pain".into(),
                keyword: "high_pain_level".into(),
                severity: 0.8,
            });
        }

        if sentiment < -0.7 {
            flags.push(ClinicalFlag {
                category: "sentiment".into(),
                keyword: "extreme_negative_sentiment".into(),
                severity: 0.5,
            });
        }

        let urgency = flags.iter().map(|f| f.severity).fold(0.0_f64, f64::max).min(1.0);
        (flags, urgency)
    }

    /// Aggregate view over a user's entries as of `today`.
    pub fn generate_insights(&self, entries: &[JournalEntry], today: NaiveDate) -> JournalInsights {
        if entries.is_empty() {
            return JournalInsights::default();
        }

        let sentiments: Vec<f64> = entries.iter().filter_map(|e| e.sentiment_score).collect();
        let avg_sentiment = if sentiments.is_empty() {
            0.0
        } else {
            sentiments.iter().sum::<f64>() / sentiments.len() as f64
        };

        let mut topic_order: Vec<(String, usize)> = Vec::new();
        for topic in entries.iter().flat_map(|e| e.topics.0.iter()) {
            match topic_order.iter_mut().find(|(t, _)| t == topic) {
                Some(slot) => slot.1 += 1,
                None => topic_order.push((topic.clone(), 1)),
            }
        }
        topic_order.sort_by(|a, b| b.1.cmp(&a.1));

        let mut mood_by_day: BTreeMap<NaiveDate, (f64, usize)> = BTreeMap::new();
        let mut words_by_day: BTreeMap<NaiveDate, f64> = BTreeMap::new();
        for entry in entries {
            let day = entry.created_at.date_naive();
            if let Some(mood) = entry.mood_rating {
                let slot = mood_by_day.entry(day).or_insert((0.0, 0));
                slot.0 += mood as f64;
                slot.1 += 1;
            }
            *words_by_day.entry(day).or_insert(0.0) += entry.word_count() as f64;
        }

        let week_ago = today - Duration::days(7);
        let month_start = today.with_day(1).unwrap_or(today);
        let days: Vec<NaiveDate> = entries.iter().map(|e| e.created_at.date_naive()).collect();

        JournalInsights {
            total_entries: entries.len(),
            avg_sentiment,
            mood_trend: mood_by_day
                .into_iter()
                .map(|(date, (sum, n))| DailyValue { date, value: sum / n as f64 })
                .collect(),
            common_topics: topic_order.into_iter().take(5).map(|(t, _)| t).collect(),
            word_count_trend: words_by_day
                .into_iter()
                .map(|(date, value)| DailyValue { date, value })
                .collect(),
            clinical_concerns: entries.iter().filter(|e| e.has_clinical_concerns()).count(),
            entries_this_week: days.iter().filter(|d| **d > week_ago).count(),
            entries_this_month: days.iter().filter(|d| **d >= month_start).count(),
            longest_streak: longest_streak(&days),
            current_streak: current_streak(&days, today),
        }
    }
}

fn distinct_sorted(days: &[NaiveDate]) -> Vec<NaiveDate> {
    let mut unique: Vec<NaiveDate> = days.to_vec();
    unique.sort_unstable();
    unique.dedup();
    unique
}

/// Longest run of consecutive calendar days with at least one entry.
pub fn longest_streak(days: &[NaiveDate]) -> u32 {
    let unique = distinct_sorted(days);
    if unique.is_empty() {
        return 0;
    }

    let mut longest = 1;
    let mut run = 1;
    for pair in unique.windows(2) {
        if pair[1] - pair[0] == Duration::days(1) {
            run += 1;
            longest = longest.max(run);
        } else {
            run = 1;
        }
    }
    longest
}

/// Consecutive days ending at the latest entry, counted only while that
/// entry is from today or yesterday.
pub fn current_streak(days: &[NaiveDate], today: NaiveDate) -> u32 {
    let unique = distinct_sorted(days);
    let Some(&latest) = unique.last() else {
        return 0;
    };
    if latest != today && latest != today - Duration::days(1) {
        return 0;
    }

    let mut streak = 1;
    for pair in unique.windows(2).rev() {
        if pair[1] - pair[0] == Duration::days(1) {
            streak += 1;
        } else {
            break;
        }
    }
    streak
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntryType;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;
    use sqlx::types::Json;
    use uuid::Uuid;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn entry_on(day: NaiveDate, content: &str, mood: Option<i32>, topics: &[&str]) -> JournalEntry {
        let at = Utc.from_utc_datetime(&day.and_hms_opt(12, 0, 0).unwrap());
        JournalEntry {
            id: Uuid::new_v4(),
            user_id: Uuid::nil(),
            title: String::new(),
            content: content.to_string(),
            entry_type: EntryType::Text,
            transcription: String::new(),
            mood_rating: mood,
            pain_level: None,
            is_private: true,
            shared_with_provider: false,
            sentiment_score: Some(0.5),
            sentiment_label: Some(SentimentLabel::Positive),
            keywords: Json(vec![]),
            entities: Json(vec![]),
            topics: Json(topics.iter().map(|t| t.to_string()).collect()),
            urgency_score: None,
            clinical_flags: Json(vec![]),
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn test_empty_content_gives_neutral_defaults() {
        let analysis = NlpService::new().analyze("   ", Some(1), Some(9));
        assert_eq!(analysis, EntryAnalysis::default());
    }

    #[test]
    fn test_sentiment_labels() {
        let nlp = NlpService::new();
        assert_eq!(nlp.sentiment("today was a great and happy day").1, SentimentLabel::Positive);
        assert_eq!(nlp.sentiment("i feel terrible and sad").1, SentimentLabel::Negative);
        assert_eq!(nlp.sentiment("went to the store").1, SentimentLabel::Neutral);
    }

    #[test]
    fn test_negation_flips_polarity() {
        let nlp = NlpService::new();
        let (score, label) = nlp.sentiment("i am not happy");
        assert!(score < 0.0);
        assert_eq!(label, SentimentLabel::Negative);
        assert!(nlp.sentiment("i don't feel bad").0 > 0.0);
    }

    #[test]
    fn test_keywords_frequency_then_first_appearance() {
        let nlp = NlpService::new();
        let kw = nlp.keywords("sleep was rough. walking helped, sleep again, walking. their coffee");
        assert_eq!(kw[0], "sleep");
        assert_eq!(kw[1], "walking");
        assert_eq!(kw[2], "rough");
        assert!(!kw.contains(&"their".to_string()));
        assert!(!kw.contains(&"was".to_string()));
    }

    #[test]
    fn test_entities_dictionary_and_dates() {
        let nlp = NlpService::new();
        let entities = nlp.entities("Took Ibuprofen on Monday for my headache; monday was long. Ibuprofen helped.");
        let labels: Vec<(&str, &str)> = entities.iter().map(|e| (e.text.as_str(), e.label.as_str())).collect();
        assert_eq!(
            labels,
            vec![("Ibuprofen", "MEDICATION"), ("Monday", "DATE"), ("headache", "SYMPTOM")]
        );
    }

    #[test]
    fn test_topics_in_fixed_order() {
        let nlp = NlpService::new();
        assert_eq!(
            nlp.topics("my boss added a deadline and my sleep suffered"),
            vec!["lifestyle", "work"]
        );
        // "stress" belongs to two topics
        assert_eq!(nlp.topics("stress"), vec!["mental_health", "work"]);
    }

    #[test]
    fn test_clinical_flags_and_urgency() {
        let nlp = NlpService::new();
        let analysis = nlp.analyze("I have chest pain and feel hopeless", Some(2), Some(8));

        let keywords: Vec<&str> = analysis.clinical_flags.iter().map(|f| f.keyword.as_str()).collect();
        assert!(keywords.contains(&"hopeless"));
        assert!(keywords.contains(&"chest pain"));
        assert!(keywords.contains(&"low_mood_rating"));
        assert!(keywords.contains(&"high_pain_level"));
        assert_eq!(analysis.urgency_score, 0.9);
    }

    #[test]
    fn test_curly_apostrophes_match() {
        let nlp = NlpService::new();
        let analysis = nlp.analyze("I can\u{2019}t breathe", None, None);
        assert_eq!(analysis.clinical_flags[0].keyword, "can't breathe");
        assert_eq!(analysis.urgency_score, 0.9);
    }

    #[test]
    fn test_streaks() {
        let today = date(2024, 5, 10);
        let days = vec![
            date(2024, 5, 1),
            date(2024, 5, 2),
            date(2024, 5, 3),
            date(2024, 5, 3),
            date(2024, 5, 8),
            date(2024, 5, 9),
        ];
        assert_eq!(longest_streak(&days), 3);
        assert_eq!(current_streak(&days, today), 2);
        // latest entry two days ago breaks the current streak
        assert_eq!(current_streak(&days, date(2024, 5, 11)), 0);
        assert_eq!(longest_streak(&[]), 0);
    }

    #[test]
    fn test_generate_insights() {
        let today = date(2024, 5, 10);
        let entries = vec![
            entry_on(date(2024, 5, 10), "slept well", Some(4), &["lifestyle"]),
            entry_on(date(2024, 5, 10), "long day", Some(2), &["work", "lifestyle"]),
            entry_on(date(2024, 4, 20), "old entry here", None, &["work"]),
        ];

        let insights = NlpService::new().generate_insights(&entries, today);
        assert_eq!(insights.total_entries, 3);
        assert_eq!(insights.common_topics, vec!["lifestyle", "work"]);
        assert_eq!(insights.entries_this_week, 2);
        assert_eq!(insights.entries_this_month, 2);
        assert_eq!(insights.mood_trend, vec![DailyValue { date: today, value: 3.0 }]);
        assert_eq!(insights.current_streak, 1);
        assert!((insights.avg_sentiment - 0.5).abs() < 1e-9);
    }

    proptest! {
        #[test]
        fn prop_sentiment_in_range(text in "[a-zA-Z' .,!]{0,200}") {
            let (score, _) = NlpService::new().sentiment(&normalize(&text));
            prop_assert!((-1.0..=1.0).contains(&score));
        }

        #[test]
        fn prop_urgency_bounded(text in "[a-z' ]{0,200}", mood in proptest::option::of(1i32..=5), pain in proptest::option::of(0i32..=10)) {
            let analysis = NlpService::new().analyze(&text, mood, pain);
            prop_assert!((0.0..=1.0).contains(&analysis.urgency_score));
            prop_assert!(analysis.keywords.len() <= 10);
        }
    }
}
