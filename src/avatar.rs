// Avatar links per chat platform

/// Shown for platforms without an avatar service.
pub const FALLBACK_AVATAR: &str =
    "http://smmcat.cn/wp-content/uploads/2024/12/DFC65DB8218C6820BD5E1BF181D545CD.jpg";

const QQ_APP_AVATAR_PREFIX: &str = "https://q.qlogo.cn/qqapp/";

pub fn avatar_url(platform: &str, bot_id: &str, user_id: &str, onebot_compat: bool) -> String {
    if onebot_compat || platform == "onebot" {
        format!("https://q1.qlogo.cn/g?b=qq&nk={}&s=0", user_id)
    } else if platform == "qq" {
        format!("http://q.qlogo.cn/qqapp/{}/{}/640", bot_id, user_id)
    } else {
        FALLBACK_AVATAR.to_string()
    }
}

/// App id embedded in a QQ bot avatar link: `https://q.qlogo.cn/qqapp/<digits>/...`
pub fn extract_app_id(avatar: &str) -> Option<String> {
    let rest = avatar.strip_prefix(QQ_APP_AVATAR_PREFIX)?;
    let (digits, _) = rest.split_once('/')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(digits.to_string())
}
