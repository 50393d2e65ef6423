/// Reserved words of the formula language.
///
/// Keywords are recognised only as whole identifiers, so `order` or `android` stay
/// plain identifiers.
#[derive(
    Debug, Clone, PartialEq, strum::EnumString, strum::Display, strum::EnumIter, strum::AsRefStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum Keyword {
    And,
    Or,
    Not,
    If,
    Else,
    In,
}
