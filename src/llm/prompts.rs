//! Prompt templates for commentary generation and transcript extraction.

use crate::types::{EventType, MatchContext, MatchEvent};

/// Team names with the definite article already applied for the locale.
#[derive(Debug, Clone)]
pub struct TeamPhrases {
    pub home: String,
    pub away: String,
}

pub fn language_name(locale: &str) -> &str {
    match locale {
        "fr" => "French",
        "en" => "English",
        "ar" => "Arabic",
        "es" => "Spanish",
        "pt" => "Portuguese",
        other => other,
    }
}

/// Strict system prompt for templated commentary.
pub fn commentary_system(locale: &str, max_sentences: usize, phrases: &TeamPhrases) -> String {
    format!(
        "You are a live football commentator writing in {lang}.\n\
         Rules:\n\
         - Write at most {max_sentences} short sentence(s).\n\
         - Refer to the teams exactly as \"{home}\" and \"{away}\", keeping the article and its \
           contractions correct in {lang}.\n\
         - Use only facts present in the event. Never invent players, minutes, scores or outcomes.\n\
         - If the event is not a goal, do not suggest that a goal was scored.\n\
         - No quotation marks, no hashtags, no emojis, no preamble.",
        lang = language_name(locale),
        home = phrases.home,
        away = phrases.away,
    )
}

/// User prompt for one canonical event.
pub fn commentary_user(event: &MatchEvent, ctx: &MatchContext, phrases: &TeamPhrases) -> String {
    if event.event_type == EventType::Analysis {
        return prematch_user(ctx, phrases);
    }

    let mut prompt = format!(
        "Match: {home} vs {away}, score {score}.\n\
         Minute: {minute}\n\
         Event type: {kind}\n",
        home = phrases.home,
        away = phrases.away,
        score = ctx.score,
        minute = event.minute_label,
        kind = event.event_type,
    );
    if let Some(team) = &event.team {
        prompt.push_str(&format!("Team: {team}\n"));
    }
    if let Some(player) = &event.player {
        prompt.push_str(&format!("Player: {player}\n"));
    }
    if event.event_type == EventType::Goal && !event.is_scoring {
        prompt.push_str("Note: the goal did not stand.\n");
    }
    prompt.push_str(&format!("Source: {}\n\nWrite the commentary line.", event.detail));
    prompt
}

/// Pre-match analysis block.
pub fn prematch_user(ctx: &MatchContext, phrases: &TeamPhrases) -> String {
    let kickoff = ctx
        .kickoff
        .map(|k| k.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "soon".to_string());
    format!(
        "Upcoming match: {home} vs {away}, kickoff {kickoff}.\n\
         Write a short pre-match preview setting the stakes. Do not predict a score and do not \
         name players.",
        home = phrases.home,
        away = phrases.away,
    )
}

/// System prompt for extraction mode: classify and draft in one JSON reply.
pub fn extraction_system(locale: &str, max_sentences: usize) -> String {
    format!(
        "You analyse live football radio/TV commentary transcripts.\n\
         Return ONLY a JSON object: {{\"events\":[{{\"type\":...,\"time\":...,\"text\":...,\
         \"player\":...,\"team\":...,\"importance\":...}}]}}\n\
         - type: one of goal, yellowCard, redCard, substitution, corner, foul, save, shot, \
           offside, commentary.\n\
         - Use goal ONLY when the transcript explicitly says a goal was scored (\"but\", \"goal\", \
           \"il marque\", \"c'est le but\") or states a new score like 1-0. Excitement, chances or \
           near misses are shot, save or commentary.\n\
         - time: match minute such as \"67'\" or \"45+2'\", or null when unknown.\n\
         - text: commentary in {lang}, at most {max_sentences} sentence(s), only facts from the \
           transcript.\n\
         - player, team: names heard in the transcript, or null.\n\
         - importance: 1 (minor) to 3 (major).\n\
         Return {{\"events\":[]}} when nothing happened.",
        lang = language_name(locale),
    )
}

pub fn extraction_user(transcript: &str, ctx: &MatchContext, phrases: &TeamPhrases) -> String {
    format!(
        "Match: {home} vs {away}, score {score}, current minute {minute}.\n\
         Transcript:\n{transcript}",
        home = phrases.home,
        away = phrases.away,
        score = ctx.score,
        minute = ctx.minute_label,
    )
}
