// ===============================
// src/ai_parse.rs
// ===============================
//
// Strict reply parser. The reply may wrap its JSON in code fences and put
// free-text reasoning before it. No JSON at all is retryable; JSON that
// misses or breaks a required field is a validation failure.
//
use serde_json::{Deserializer, Value};

use crate::ai::DecisionContext;
use crate::domain::{Action, Decision, Side};
use crate::error::AiError;

/// First JSON object/array in `text` and the text that precedes it.
fn extract_json(text: &str) -> Option<(Value, &str)> {
    for (i, ch) in text.char_indices() {
        if ch != '{' && ch != '[' {
            continue;
        }
        let mut it = Deserializer::from_str(&text[i..]).into_iter::<Value>();
        if let Some(Ok(v)) = it.next() {
            let list_of_objects = v.as_array().is_some_and(|a| a.iter().all(Value::is_object));
            if v.is_object() || list_of_objects {
                return Some((v, &text[..i]));
            }
        }
    }
    None
}

fn clean_reasoning(prefix: &str) -> String {
    prefix
        .lines()
        .filter(|l| !l.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

fn field<'a>(obj: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| obj.get(*k)).filter(|v| !v.is_null())
}

/// Number or numeric string.
fn number(obj: &Value, keys: &[&str]) -> Result<Option<f64>, AiError> {
    let Some(v) = field(obj, keys) else { return Ok(None) };
    let n = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches(['x', 'X', '%']).trim().parse::<f64>().ok(),
        _ => None,
    };
    match n {
        Some(n) if n.is_finite() => Ok(Some(n)),
        _ => Err(AiError::Validation(format!("{} is not a number: {v}", keys[0]))),
    }
}

fn text_field(obj: &Value, keys: &[&str]) -> Option<String> {
    field(obj, keys).and_then(Value::as_str).map(str::trim).filter(|s| !s.is_empty()).map(String::from)
}

pub fn normalize_asset(raw: &str) -> String {
    let up = raw.trim().to_ascii_uppercase();
    let up = up.trim_end_matches("-PERP");
    let up = up.trim_end_matches("/USDT").trim_end_matches("USDT");
    up.to_string()
}

fn parse_side(s: &str) -> Option<Side> {
    match s.trim().to_ascii_lowercase().as_str() {
        "long" | "buy" => Some(Side::Long),
        "short" | "sell" => Some(Side::Short),
        _ => None,
    }
}

/// (action, side from the action name)
fn parse_action(raw: &str) -> Result<(Action, Option<Side>), AiError> {
    let a = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
    let (verb, side) = match a.split_once('_') {
        Some((verb, rest)) => (verb.to_string(), parse_side(rest)),
        None => (a.clone(), None),
    };
    let action = match verb.as_str() {
        "open" => Action::Open,
        "close" => Action::Close,
        "adjust" | "update" => Action::Adjust,
        "hold" | "wait" | "none" => Action::Hold,
        "buy" | "long" => return Ok((Action::Open, Some(Side::Long))),
        "sell" | "short" => return Ok((Action::Open, Some(Side::Short))),
        _ => return Err(AiError::Validation(format!("unknown action {raw:?}"))),
    };
    Ok((action, side))
}

fn leverage(obj: &Value) -> Result<Option<u32>, AiError> {
    match number(obj, &["leverage", "lev"])? {
        None => Ok(None),
        Some(l) if l >= 1.0 && l.fract() == 0.0 && l <= 1_000.0 => Ok(Some(l as u32)),
        Some(l) => Err(AiError::Validation(format!("leverage must be a whole number >= 1, got {l}"))),
    }
}

fn require<T>(v: Option<T>, what: &str, action: Action) -> Result<T, AiError> {
    v.ok_or_else(|| AiError::Validation(format!("{what} is required for {}", action.as_str())))
}

/// Parses one AI reply into a `Decision`, stamped with the reference price
/// of its asset from the context.
pub fn parse_decision(reply: &str, ctx: &DecisionContext) -> Result<Decision, AiError> {
    let (json, prefix) =
        extract_json(reply).ok_or_else(|| AiError::Transient("reply contains no JSON object".into()))?;

    // one decision per cycle; a list is only accepted when it holds one
    let obj = match json {
        Value::Array(items) => {
            let mut objects: Vec<Value> = items.into_iter().filter(Value::is_object).collect();
            match objects.len() {
                0 => return Ok(Decision::hold("empty decision list")),
                1 => objects.remove(0),
                n => return Err(AiError::Validation(format!("expected one decision, got a list of {n}"))),
            }
        }
        o => o,
    };

    let raw_action =
        text_field(&obj, &["action", "decision"]).ok_or_else(|| AiError::Validation("action is missing".into()))?;
    let (action, side_from_action) = parse_action(&raw_action)?;

    let reasoning = text_field(&obj, &["reasoning", "reason", "rationale"]).unwrap_or_else(|| clean_reasoning(prefix));

    if action == Action::Hold {
        let mut d = Decision::hold(reasoning);
        if let Some(a) = text_field(&obj, &["symbol", "asset", "coin"]) {
            d.asset = normalize_asset(&a);
        }
        return Ok(d);
    }

    let side = match side_from_action {
        Some(s) => Some(s),
        None => match text_field(&obj, &["side", "direction"]) {
            Some(s) => Some(parse_side(&s).ok_or_else(|| AiError::Validation(format!("unknown side {s:?}")))?),
            None => None,
        },
    };
    let side = require(side, "side", action)?;
    let asset = require(text_field(&obj, &["symbol", "asset", "coin"]).map(|a| normalize_asset(&a)), "symbol", action)?;

    let stop_loss = number(&obj, &["stop_loss", "sl", "stopLoss"])?;
    let take_profit = number(&obj, &["take_profit", "tp", "takeProfit"])?;
    for (name, v) in [("stop_loss", stop_loss), ("take_profit", take_profit)] {
        if matches!(v, Some(p) if p <= 0.0) {
            return Err(AiError::Validation(format!("{name} must be positive")));
        }
    }
    let confidence = number(&obj, &["confidence"])?.map(|c| c.clamp(0.0, 100.0) as u8);

    let snapshot_price = ctx.snapshot(&asset).map(|s| s.mid());
    let position_price = ctx.account.position(&asset, side).map(|p| p.mark_price);

    let mut d = Decision {
        action,
        asset,
        side: Some(side),
        size_usd: 0.0,
        leverage: 0,
        stop_loss,
        take_profit,
        reference_price: snapshot_price.or(position_price).unwrap_or(0.0),
        confidence,
        reasoning,
    };

    match action {
        Action::Open => {
            let size = require(number(&obj, &["position_size_usd", "size_usd", "size"])?, "position_size_usd", action)?;
            if size <= 0.0 {
                return Err(AiError::Validation(format!("position size must be positive, got {size}")));
            }
            d.size_usd = size;
            d.leverage = require(leverage(&obj)?, "leverage", action)?;
            require(d.stop_loss, "stop_loss", action)?;
            require(d.take_profit, "take_profit", action)?;
            d.reference_price = snapshot_price
                .ok_or_else(|| AiError::Validation(format!("{} is not in the market context", d.asset)))?;
        }
        Action::Adjust => {
            if d.stop_loss.is_none() && d.take_profit.is_none() {
                return Err(AiError::Validation("adjust needs stop_loss or take_profit".into()));
            }
        }
        Action::Close | Action::Hold => {}
    }
    Ok(d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AccountState, ExchangeKind, MarketSnapshot, Position};
    use chrono::Utc;

    fn ctx() -> DecisionContext {
        let now = Utc::now();
        DecisionContext {
            trader_id: "t1".into(),
            snapshots: vec![MarketSnapshot {
                exchange: ExchangeKind::Paper,
                asset: "BTC".into(),
                last_price: 100.0,
                best_bid: 99.0,
                best_ask: 101.0,
                ts: now,
                seq: 1,
                stale: false,
            }],
            account: AccountState {
                exchange: ExchangeKind::Paper,
                equity: 10_000.0,
                available_margin: 10_000.0,
                positions: vec![Position {
                    asset: "ETH".into(),
                    side: Side::Short,
                    size: 1.0,
                    entry_price: 3_000.0,
                    mark_price: 2_950.0,
                    unrealized_pnl: 50.0,
                    leverage: 3,
                    margin: 1_000.0,
                    stop_loss: None,
                    take_profit: None,
                }],
                ts: now,
            },
            history: vec![],
            now,
        }
    }

    #[test]
    fn fenced_reply_with_reasoning_prefix() {
        let reply = "BTC is breaking out.\n```json\n{\"action\":\"open_long\",\"symbol\":\"BTCUSDT\",\"position_size_usd\":\"500\",\"leverage\":3,\"stop_loss\":98,\"take_profit\":106}\n```";
        let d = parse_decision(reply, &ctx()).unwrap();
        assert_eq!(d.action, Action::Open);
        assert_eq!(d.side, Some(Side::Long));
        assert_eq!(d.asset, "BTC");
        assert_eq!(d.size_usd, 500.0);
        assert_eq!(d.reference_price, 100.0);
        assert_eq!(d.reasoning, "BTC is breaking out.");
    }

    #[test]
    fn action_and_side_fields() {
        let d = parse_decision(r#"{"action":"close","side":"sell","asset":"eth","reasoning":"done"}"#, &ctx()).unwrap();
        assert_eq!(d.action, Action::Close);
        assert_eq!(d.side, Some(Side::Short));
        assert_eq!(d.reference_price, 2_950.0);
        assert_eq!(d.reasoning, "done");
    }

    #[test]
    fn open_without_stop_loss_is_validation() {
        let r = parse_decision(
            r#"{"action":"open_short","symbol":"BTC","position_size_usd":100,"leverage":2,"take_profit":90}"#,
            &ctx(),
        );
        assert!(matches!(r, Err(AiError::Validation(m)) if m.contains("stop_loss")));
    }

    #[test]
    fn fractional_leverage_is_validation() {
        let r = parse_decision(
            r#"{"action":"open_long","symbol":"BTC","position_size_usd":100,"leverage":2.5,"stop_loss":98,"take_profit":106}"#,
            &ctx(),
        );
        assert!(matches!(r, Err(AiError::Validation(_))));
    }

    #[test]
    fn open_on_unknown_asset_is_validation() {
        let r = parse_decision(
            r#"{"action":"open_long","symbol":"DOGE","position_size_usd":100,"leverage":2,"stop_loss":0.1,"take_profit":0.2}"#,
            &ctx(),
        );
        assert!(matches!(r, Err(AiError::Validation(m)) if m.contains("DOGE")));
    }

    #[test]
    fn no_json_is_transient() {
        assert!(matches!(parse_decision("I think we should wait.", &ctx()), Err(AiError::Transient(_))));
    }

    #[test]
    fn single_item_list_is_unwrapped_and_empty_list_holds() {
        let d = parse_decision(r#"[{"action":"wait"}]"#, &ctx()).unwrap();
        assert_eq!(d.action, Action::Hold);
        assert_eq!(parse_decision("[]", &ctx()).unwrap().action, Action::Hold);
    }

    #[test]
    fn several_decisions_in_one_reply_are_invalid() {
        let err = parse_decision(r#"[{"action":"wait"},{"action":"open_long"}]"#, &ctx()).unwrap_err();
        assert!(matches!(err, AiError::Validation(ref m) if m.contains("list of 2")), "{err:?}");
    }

    #[test]
    fn adjust_needs_a_level() {
        let r = parse_decision(r#"{"action":"adjust_short","symbol":"ETH"}"#, &ctx());
        assert!(matches!(r, Err(AiError::Validation(_))));
        let d = parse_decision(r#"{"action":"adjust_short","symbol":"ETH","stop_loss":"3010"}"#, &ctx()).unwrap();
        assert_eq!(d.stop_loss, Some(3_010.0));
    }

    #[test]
    fn unknown_action_is_validation() {
        assert!(matches!(parse_decision(r#"{"action":"yolo"}"#, &ctx()), Err(AiError::Validation(_))));
    }
}
