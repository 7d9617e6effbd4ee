//! Instruction templates sent to the model and the closed label sets expected back.

use std::sync::LazyLock;

use aho_corasick::{AhoCorasick, MatchKind};

pub const SYSTEM_PROMPT: &str = "You are a neutral linguistic analysis expert focused on detecting weaponization of cultural heritage.";

const ARMENIAN_TERMS: &str = "  \
  - \"Armenian Genocide\" (vs \"alleged\" or \"disputed\" genocide)
  - \"Historical Armenian lands\" / \"Western Armenia\"
  - \"Cultural erasure of Armenians in Nakhichevan\"
  - \"Destruction of khachkars in Julfa\"
  - \"Ethnic cleansing of Armenians from Artsakh\"
  - \"Ancient Armenian monasteries in present-day Turkey\"
  - \"Armenian heritage sites under Azerbaijani control\"
  - \"Forced demographic changes in Nagorno-Karabakh\"";

const RIVAL_TERMS: &str = "  \
  - \"So-called Armenian Genocide\"
  - \"Turkish–Armenian relocation\" / \"1915 deportations\"
  - \"Caucasian Albanian heritage\" (used to reattribute Armenian sites)
  - \"Illegal occupation of Karabakh by Armenia\"
  - \"Liberation of Azerbaijani lands\"
  - \"Fabricated Armenian claims\"
  - \"Armenian aggression\"
  - \"Armenian terrorism\" (used to describe ASALA/other groups)
  - \"Destruction of Azerbaijani cultural sites by Armenians\"";

const IMPLICATION: &str = "Implication or consequence: These terms may be used to justify actions, shift narratives, or frame cultural or territorial control in a specific light.";

/// Binary judgment of one revision record (rendered as pretty-printed JSON).
pub fn detection_prompt(record_json: &str) -> String {
    format!(
        "
You are an expert linguistic analysis assistant specializing in detecting subtle shifts in language that might be used to weaponize cultural heritage.

The input is a JSON record representing a Wikipedia article revision. The record follows one of these structures:
1. For the original article version (version \"first_version\"):
   {{
     \"version\": \"first_version\",
     \"Content\": \"<full article text>\"
   }}
2. For a revision (version \"diff\"):
   {{
     \"version\": \"diff\",
     \"Timestamp\": \"<ISO timestamp>\",
     \"User\": \"<editor identifier>\",
     \"Comment\": \"<revision comment>\",
     \"Diff\": \"<original textual diff in unified diff format>\"
     \"Added_Lines\": [<list of lines outright added>],
     \"Removed_Lines\": [<list of lines outright removed>],
     \"Added_Words\": [<list of words added in modified sentences>],
     \"Removed_Words\": [<list of words removed in modified sentences>]
   }}

⚠️ Important Instructions:
- If the version is \"diff\", focus primarily on the Added_Lines, Removed_Lines, Added_Words, and Removed_Words fields, i.e. on the lines (and words) actually added or deleted (i.e. not the lines that are untouched) as well as whatever additional context provided by the \"User\" and \"Comment\" fields.
- Ignore lines in the Diff field that have no prefix — these are unchanged context.
- Do not evaluate unchanged paragraphs for weaponization unless they were modified.
- For an original version (version \"first_version\"), treat it as baseline text.
- Analyze the text for subtle shifts in tone, style, or content that may be used to weaponize cultural heritage.

Below are examples of weaponisation terms and narratives:
• Term (Armenian Perspective):
{ARMENIAN_TERMS}
• Term (Turkish/Azerbaijani/Rival Perspective):
{RIVAL_TERMS}
{IMPLICATION}

Using these examples as guidance, please provide a clear Judgment (\"Weaponised\" or \"Not Weaponised\" (if the change is grammatical, stylistic, or unrelated to cultural/political narratives)) along with a brief Explanation citing specific linguistic indicators from the \"+\" or \"-\" lines only.
Note that each entry might not strictly immediately follow prior ones, so only judge the entry by its own merit.

Here is the input JSON:
{record_json}

Your analysis:
"
    )
}

/// Stance of a revision that was already judged to be weaponised.
pub fn stance_prompt(record_json: &str) -> String {
    format!(
        "
You are an expert linguistic analysis assistant specializing in detecting subtle shifts in language that might be used to weaponize cultural heritage.

The input is a JSON record representing a Wikipedia article revision. The record follows this structure:
   {{
     \"Source\": \"<original article name>\",
     \"Timestamp\": \"<ISO timestamp>\",
     \"User\": \"<editor identifier>\",
     \"Comment\": \"<revision comment>\",
     \"Diff\": \"<original textual diff in unified diff format>\"
     \"Added_Lines\": [<list of lines outright added>],
     \"Removed_Lines\": [<list of lines outright removed>],
     \"Added_Words\": [<list of words added in modified sentences>],
     \"Removed_Words\": [<list of words removed in modified sentences>]
   }}

⚠️ Important Instructions:
- Focus primarily on the Added_Lines, Removed_Lines, Added_Words, and Removed_Words fields, i.e. on the lines (and words) actually added or deleted (i.e. not the lines that are untouched) as well as whatever additional context provided by the \"User\" and \"Comment\" fields.
- Ignore lines in the Diff field that have no prefix — these are unchanged context.
- Do not evaluate unchanged paragraphs for weaponization unless they were modified.
- Analyze the text for subtle shifts in tone, style, or content that may be used to weaponize cultural heritage.

Below are examples of weaponisation terms and narratives:
• Term (Pro-Armenian Perspective):
{ARMENIAN_TERMS}
• Term (General Anti-Armenian aka Turkish/Azerbaijani/Rival Perspective):
{RIVAL_TERMS}
{IMPLICATION}

Using these examples as guidance, and - given that the given entry has already been judged as containing weaponization by a prior pipeline - please provide a clear Judgment (either \"Pro-Armenian\" or \"Anti-Armenian\") along with a brief Explanation citing specific linguistic indicators from the \"+\" or \"-\" lines only.
Special note that for the purpose of this analysis, \"Pro-Armenian\" can also encompass anti-Turkish or anti-Azerbaijani or anti-any-other-Armenian-historical-rival stances, while \"Anti-Armenian\" can also encompass pro-Turkish or pro-Azerbaijani or pro-any-other-Armenian-historical-rival stances.
Note that each entry might not strictly immediately follow prior ones, so only judge the entry by its own merit.

Here is the input JSON:
{record_json}

Your analysis:
"
    )
}

/// Pick one weaponization technique for an earlier analysis text.
pub fn technique_prompt(analysis: &str) -> String {
    let mut techniques = String::new();
    for technique in Technique::ALL {
        techniques.push_str(&format!(
            "            \"{}\": {}\n",
            technique.as_str(),
            technique.definition()
        ));
    }

    format!(
        "
    You are an expert in political narratives, conflict studies, and cultural heritage.
    You are currently investigating revisions on Wikipedia articles for potential weaponization of cultural heritage topics.
    The below is the analysis of one such revision already made earlier in the pipeline. It is a given that the original revision has employed weaponization.
    Your task is to choose, among the given list of weaponization techniques, the ONE most likely weaponization technique the original revision employed.
    Full list of weaponization techniques to choose from as well as their exact definition (and example) in this context (LIMITED TO THESE OPTIONS, NO OTHER):
{techniques}
    Analysis of the revision to categorize: {analysis}

    Answer ONLY with the name of the chosen technique exactly as is - NO explanations or definitions.
    "
    )
}

/// Trim a bare label answer and drop any quote characters around or inside it.
pub fn clean_label(text: &str) -> String {
    text.trim().replace(['"', '\''], "")
}

/// Finds the first label of a closed vocabulary in free-form text.
///
/// Matching is ASCII case-insensitive and prefers the longest label at the leftmost position, so
/// `Not Weaponised` is never mistaken for `Weaponised`.
struct LabelMatcher<L: Copy> {
    automaton: AhoCorasick,
    labels: Vec<L>,
}

impl<L: Copy> LabelMatcher<L> {
    fn new(spellings: &[(&str, L)]) -> Self {
        let automaton = AhoCorasick::builder()
            .ascii_case_insensitive(true)
            .match_kind(MatchKind::LeftmostLongest)
            .build(spellings.iter().map(|(pattern, _)| pattern))
            .unwrap(); /* patterns are static */

        Self {
            automaton,
            labels: spellings.iter().map(|(_, label)| *label).collect(),
        }
    }

    fn find(&self, text: &str) -> Option<L> {
        self.automaton
            .find(text)
            .map(|m| self.labels[m.pattern().as_usize()])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Judgment {
    Weaponised,
    NotWeaponised,
}

impl Judgment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Judgment::Weaponised => "Weaponised",
            Judgment::NotWeaponised => "Not Weaponised",
        }
    }

    pub fn find_in(text: &str) -> Option<Self> {
        static MATCHER: LazyLock<LabelMatcher<Judgment>> = LazyLock::new(|| {
            LabelMatcher::new(&[
                ("Weaponised", Judgment::Weaponised),
                ("Weaponized", Judgment::Weaponised),
                ("Not Weaponised", Judgment::NotWeaponised),
                ("Not Weaponized", Judgment::NotWeaponised),
                ("Not-Weaponised", Judgment::NotWeaponised),
                ("Not-Weaponized", Judgment::NotWeaponised),
            ])
        });
        MATCHER.find(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stance {
    ProArmenian,
    AntiArmenian,
}

impl Stance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stance::ProArmenian => "Pro-Armenian",
            Stance::AntiArmenian => "Anti-Armenian",
        }
    }

    pub fn find_in(text: &str) -> Option<Self> {
        static MATCHER: LazyLock<LabelMatcher<Stance>> = LazyLock::new(|| {
            LabelMatcher::new(&[
                ("Pro-Armenian", Stance::ProArmenian),
                ("Pro Armenian", Stance::ProArmenian),
                ("Anti-Armenian", Stance::AntiArmenian),
                ("Anti Armenian", Stance::AntiArmenian),
            ])
        });
        MATCHER.find(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Technique {
    TerminologyBiasing,
    EuphemismAndDoublespeak,
    SelectiveOmission,
    SelectiveInsertion,
    SourceBiasing,
    CitationWashing,
    CitationDeletion,
    TagManipulation,
    GlorificationAndVilification,
    TimelineRewriting,
}

impl Technique {
    pub const ALL: [Technique; 10] = [
        Technique::TerminologyBiasing,
        Technique::EuphemismAndDoublespeak,
        Technique::SelectiveOmission,
        Technique::SelectiveInsertion,
        Technique::SourceBiasing,
        Technique::CitationWashing,
        Technique::CitationDeletion,
        Technique::TagManipulation,
        Technique::GlorificationAndVilification,
        Technique::TimelineRewriting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Technique::TerminologyBiasing => "Terminology Biasing",
            Technique::EuphemismAndDoublespeak => "Euphemism and Doublespeak",
            Technique::SelectiveOmission => "Selective Omission",
            Technique::SelectiveInsertion => "Selective Insertion",
            Technique::SourceBiasing => "Source Biasing",
            Technique::CitationWashing => "Citation Washing",
            Technique::CitationDeletion => "Citation Deletion",
            Technique::TagManipulation => "Tag Manipulation",
            Technique::GlorificationAndVilification => "Glorification & Vilification",
            Technique::TimelineRewriting => "Timeline Rewriting",
        }
    }

    pub fn definition(&self) -> &'static str {
        match self {
            Technique::TerminologyBiasing => "Swapping neutral, or standard, or slanted-towards-one-side terms (for names, titles, exonyms, etc.) for alternatives culturally/ideologically slanted towards another side. Examples: \"Armenian Genocide\" vs. \"Armenian Relocation\" vs. \"so-called Armenian Genocide\", etc.",
            Technique::EuphemismAndDoublespeak => "Replacing direct language with softer phrasing to obscure meaning. Example: revision changing \"official state denial of the Armenian Genocide\" to \"that is considered by many historians as official state denial of the Armenian Genocide\", or revision changing \"denying the Armenian Genocide\" to \"disputing the appropriateness of the Genocide label.\" ",
            Technique::SelectiveOmission => "Deleting inconvenient facts, dates, or events in the text proper to skew the narrative. Example: revision deleting significant passage that details the rounding up and imprisonment of Armenian intellectuals during the events of April 1915, or revision removing the line `[[Category:Genocides in Asia]]` when it comes to the Armenian Genocide article.",
            Technique::SelectiveInsertion => "Adding one-sided or fringe claims/ facts in the text proper that favor a particular agenda. Example: revision adding \"===Websites supporting the genocide theses===\" including an entire series of links to pro-Armenian websites; or revision claiming that \"No Turkish state official has visited Tsitsernakaberd.\".",
            Technique::SourceBiasing => "Replacing reputable citations with partisan (no matter how verifiable or otherwise) ones. Example: revision replacing a reference to a source that provided a more general context about the Armenian Genocide with a specific citation from Dennis Papazian's book, \"What Every Armenian Should Know.\"",
            Technique::CitationWashing => "Bulk-adding irrelevant or low-quality citations to fake credibility. Example: adding multiple low-quality sources (e.g., blogs, self-published sources, etc.) to support Turkish/Armenian claims.",
            Technique::CitationDeletion => "Removing citations to make opposing views appear less verifiable. Example: removing a citation to Michael M. Gunter's work on \"Armenian Terrorism\" by claiming him as a \"genocide denialist\" without evidence.",
            Technique::TagManipulation => "Adding or removing specific Wikipedia tags (e.g., \"neutrality disputed\", \"citation needed\", etc.) to influence readers' perception of the article's credibility or bias. Example: revisions adding or removing \"neutral point of view\" tags on articles related to the Armenian Genocide, or addition/removal of the \"msg:TotallyDisputed\" tag, among others.",
            Technique::GlorificationAndVilification => "Portraying own or friendly subjects as more heroic, justified, and righteous, etc; and/or Portraying opposing subjects to oneself/\"enemies\" as more evil, wicked, barbaric, etc.; via loaded and emotionally appealing language. Examples: revision claiming that Armenians \"were mean people and hated americans.\"; or revisions adding references to \"MASSACRE BY TURKS IN CAUCASUS TOWNS\" and in the process highlight Turkish atrocities while emotionally highlighting Armenian victimhood. ",
            Technique::TimelineRewriting => "Shifting dates or sequences to alter causality or responsibility. Example: revision changing changes the date range of the Armenian Genocide from \"1915-1916\" to \"1915-1922.\", or revision changing the April 24 arrest of Armenian intellectuals in 1915 from as simple \"an event during the Armenian Genocide\" to \"the first major event of the Armenian Genocide\".",
        }
    }

    pub fn find_in(text: &str) -> Option<Self> {
        static MATCHER: LazyLock<LabelMatcher<Technique>> = LazyLock::new(|| {
            let mut spellings: Vec<(&str, Technique)> =
                Technique::ALL.iter().map(|t| (t.as_str(), *t)).collect();
            spellings.push(("Glorification and Vilification", Technique::GlorificationAndVilification));
            spellings.push(("Euphemism & Doublespeak", Technique::EuphemismAndDoublespeak));
            LabelMatcher::new(&spellings)
        });
        MATCHER.find(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_judgment_prefers_negation() {
        assert_eq!(
            Judgment::find_in("**Judgment:** Not Weaponised\n**Explanation:** ..."),
            Some(Judgment::NotWeaponised)
        );
        assert_eq!(
            Judgment::find_in("Judgment: Weaponised. The edit replaces ..."),
            Some(Judgment::Weaponised)
        );
        assert_eq!(
            Judgment::find_in("judgment: not weaponized"),
            Some(Judgment::NotWeaponised)
        );
        assert_eq!(Judgment::find_in("Error during API call: request timed out"), None);
    }

    #[test]
    fn test_stance() {
        assert_eq!(
            Stance::find_in("Judgment: Anti-Armenian\nExplanation: the word 'so-called'..."),
            Some(Stance::AntiArmenian)
        );
        assert_eq!(Stance::find_in("PRO-ARMENIAN"), Some(Stance::ProArmenian));
        assert_eq!(Stance::find_in("undecided"), None);
    }

    #[test]
    fn test_technique_labels() {
        for technique in Technique::ALL {
            assert_eq!(Technique::find_in(technique.as_str()), Some(technique));
        }
        assert_eq!(
            Technique::find_in(&clean_label(" \"Selective Omission\" ")),
            Some(Technique::SelectiveOmission)
        );
        assert_eq!(
            Technique::find_in("glorification and vilification"),
            Some(Technique::GlorificationAndVilification)
        );
        assert_eq!(Technique::find_in("Image Manipulation"), None);
    }

    #[test]
    fn test_clean_label() {
        assert_eq!(clean_label("  'Citation Washing'\n"), "Citation Washing");
        assert_eq!(clean_label("\"Tag Manipulation\""), "Tag Manipulation");
    }

    #[test]
    fn test_prompts_embed_input() {
        let record = "{\n  \"version\": \"diff\"\n}";
        let prompt = detection_prompt(record);
        assert!(prompt.contains(record));
        assert!(prompt.contains("\"Not Weaponised\""));
        assert!(prompt.trim_end().ends_with("Your analysis:"));

        let prompt = stance_prompt(record);
        assert!(prompt.contains(record));
        assert!(prompt.contains("\"Anti-Armenian\""));

        let prompt = technique_prompt("The edit removes the genocide category.");
        assert!(prompt.contains("The edit removes the genocide category."));
        for technique in Technique::ALL {
            assert!(prompt.contains(technique.as_str()));
        }
    }

    #[test]
    fn test_prompt_wording() {
        let prompt = detection_prompt("{}");
        assert!(prompt.starts_with("\nYou are an expert linguistic analysis assistant"));
        assert!(prompt.contains("• Term (Armenian Perspective):\n  - \"Armenian Genocide\""));
        assert!(prompt.contains("\n• Term (Turkish/Azerbaijani/Rival Perspective):\n  - \"So-called"));
        assert!(prompt.contains("\"Diff\": \"<original textual diff in unified diff format>\"\n"));
        assert!(prompt.ends_with("Here is the input JSON:\n{}\n\nYour analysis:\n"));

        let prompt = stance_prompt("{}");
        assert!(prompt.contains("• Term (Pro-Armenian Perspective):\n"));
        assert!(prompt.contains(
            "• Term (General Anti-Armenian aka Turkish/Azerbaijani/Rival Perspective):\n"
        ));
        assert!(prompt.contains("already been judged as containing weaponization by a prior pipeline"));

        let prompt = technique_prompt("first");
        assert!(prompt.contains("their exact definition (and example) in this context (LIMITED TO THESE OPTIONS, NO OTHER):\n            \"Terminology Biasing\": Swapping neutral, or standard,"));
        assert!(prompt.contains("\"Genocide label.\" \n            \"Selective Omission\":"));
        assert!(prompt.contains("victimhood. \n            \"Timeline Rewriting\":"));
        assert!(prompt.ends_with(
            "\n\n    Analysis of the revision to categorize: first\n\n    Answer ONLY with the name of the chosen technique exactly as is - NO explanations or definitions.\n    "
        ));
    }
}
