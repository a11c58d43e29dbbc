//! Tora-ossan persona assets
//!
//! The static character profile, the dynamic system instruction assembled
//! from it, and the text massaging applied before speech synthesis and image
//! generation.

use chrono::{FixedOffset, Utc};

/// Character sheet injected into every system instruction.
pub const TORA_OSSAN_PROFILE: &str = "\
あなたは「虎おっさん」。兵庫県尼崎市出身、阪神タイガースひと筋50年のおっさんや。
- 一人称は「ワイ」。尼崎寄りのコテコテの関西弁で喋る
- 阪神の話題になると異常に熱くなる。甲子園のライトスタンドが心の故郷
- 巨人の話題にはちょっとだけ不機嫌になるが、野球そのものへの愛は深い
- 口癖は「〜やで！」「どないやねん」「知らんけど」
- 人情に厚く、野球以外の相談にも案外ちゃんと乗ってくれる";

/// Emoji the persona sprinkles into replies; stripped before synthesis so the
/// voice does not read them out.
const SPEECH_STRIP: [char; 5] = ['*', '#', '🐯', '⚾', '🔥'];

/// Build the system instruction for a text chat turn: current JST wall-clock
/// time, the profile, and the reply-length directive.
pub fn system_instruction() -> String {
    format!(
        "現在の日本時間: {}\n{}\n上記の現在日時を考慮して会話してください。\n\
         【重要指示】回答は3行程度（100文字〜150文字程度）にしてください。\
         尼崎のおっさんらしく、短くも熱い返答をすること。",
        jst_now(),
        TORA_OSSAN_PROFILE
    )
}

/// System instruction for the realtime voice session. No line-count directive
/// here; spoken turns are paced by the model.
pub fn voice_instruction() -> String {
    format!(
        "現在の日本時間: {}\n{}\n音声で応答すること。短く、熱く、尼崎弁で喋ること。",
        jst_now(),
        TORA_OSSAN_PROFILE
    )
}

/// Prepare reply text for the synthesizer: drop markdown emphasis markers and
/// emoji, and respell 岩崎 so it is read イワザキ rather than イワサキ.
pub fn clean_for_speech(text: &str) -> String {
    let stripped: String = text
        .chars()
        .filter(|c| !SPEECH_STRIP.contains(c) && *c != '\u{fe0f}')
        .collect();
    stripped.replace("岩崎", "イワザキ")
}

/// Wrap cleaned reply text in the persona voicing instruction.
pub fn speech_prompt(clean_text: &str) -> String {
    format!("尼崎弁の虎ファンとして熱く読み上げろ: {clean_text}")
}

/// Wrap a user prompt in the persona illustration request.
pub fn image_prompt(prompt: &str) -> String {
    format!("阪神タイガースファンの虎おっさんが喜ぶような、{prompt} のイラストを描いて。")
}

fn jst_now() -> String {
    // UTC+9, no DST.
    let jst = FixedOffset::east_opt(9 * 3600).expect("static UTC+9 offset");
    Utc::now()
        .with_timezone(&jst)
        .format("%Y/%m/%d %H:%M:%S")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speech_cleanup_strips_markup_and_emoji() {
        let cleaned = clean_for_speech("**六甲おろし**や🐯⚾️🔥 #阪神");
        assert_eq!(cleaned, "六甲おろしや 阪神");
    }

    #[test]
    fn speech_cleanup_respells_iwazaki() {
        assert_eq!(clean_for_speech("岩崎が抑えや"), "イワザキが抑えや");
    }

    #[test]
    fn speech_cleanup_leaves_plain_text_alone() {
        assert_eq!(clean_for_speech("今日も勝ったで"), "今日も勝ったで");
    }

    #[test]
    fn system_instruction_carries_profile_and_clock() {
        let instruction = system_instruction();
        assert!(instruction.contains("虎おっさん"));
        assert!(instruction.contains("現在の日本時間"));
        assert!(instruction.contains("3行程度"));
    }

    #[test]
    fn prompt_wrappers() {
        assert!(speech_prompt("勝ったで").starts_with("尼崎弁の虎ファンとして"));
        assert!(image_prompt("優勝パレード").contains("優勝パレード"));
    }
}
