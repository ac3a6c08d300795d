//! APDU classification and best-effort EMV field extraction.
//!
//! Commands are classified from their four header bytes. Data fields and
//! response bodies are scanned as BER-TLV for the handful of EMV tags the
//! compliance rules care about. Anything unparseable is simply ignored.

use crate::error::{AppError, Result};
use crate::models::envelope::CommandClass;
use crate::models::session::ApduDirection;

pub const INS_SELECT: u8 = 0xA4;
pub const INS_READ_BINARY: u8 = 0xB0;
pub const INS_READ_BINARY_ODD: u8 = 0xB1;
pub const INS_READ_RECORD: u8 = 0xB2;
pub const INS_WRITE_BINARY: u8 = 0xD0;
pub const INS_WRITE_BINARY_ODD: u8 = 0xD1;
pub const INS_UPDATE_BINARY: u8 = 0xD6;
pub const INS_GET_CHALLENGE: u8 = 0x84;
pub const INS_INTERNAL_AUTHENTICATE: u8 = 0x88;
pub const INS_VERIFY: u8 = 0x20;
pub const INS_PUT_KEY: u8 = 0xD8;
pub const INS_CARD_BLOCK: u8 = 0x16;
pub const INS_APPLICATION_BLOCK: u8 = 0x1E;
pub const INS_TERMINATE_CARD_USAGE: u8 = 0xFE;

const TAG_PAN: u32 = 0x5A;
const TAG_AMOUNT_AUTHORISED: u32 = 0x9F02;
const TAG_CURRENCY_CODE: u32 = 0x5F2A;
const TAG_MERCHANT_CATEGORY: u32 = 0x9F15;

const MAX_TLV_DEPTH: u8 = 4;

/// Everything the relay learns from one raw APDU.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApduAnalysis {
    pub command_class: Option<CommandClass>,
    pub command_type: String,
    pub application_id: Option<String>,
    pub transaction_type: String,
    pub amount: Option<u64>,
    pub currency: Option<String>,
    pub merchant_category: Option<String>,
    pub pan: Option<String>,
    pub pin: Option<String>,
    pub critical_operation: Option<String>,
    pub risk_score: u8,
}

impl ApduAnalysis {
    pub fn class(&self) -> CommandClass {
        self.command_class.unwrap_or(CommandClass::Unknown)
    }
}

/// Maps an instruction byte to its class.
pub fn classify_instruction(ins: u8) -> CommandClass {
    match ins {
        INS_SELECT => CommandClass::Select,
        INS_READ_BINARY | INS_READ_BINARY_ODD | INS_READ_RECORD => CommandClass::Read,
        INS_WRITE_BINARY | INS_WRITE_BINARY_ODD | INS_UPDATE_BINARY => CommandClass::Write,
        INS_GET_CHALLENGE => CommandClass::GetChallenge,
        INS_INTERNAL_AUTHENTICATE => CommandClass::InternalAuthenticate,
        _ => CommandClass::Unknown,
    }
}

/// Instructions that alter card keys or card lifecycle.
pub fn critical_operation(ins: u8) -> Option<&'static str> {
    match ins {
        INS_PUT_KEY => Some("UPDATE_KEY"),
        INS_CARD_BLOCK => Some("CARD_BLOCK"),
        INS_APPLICATION_BLOCK => Some("APPLICATION_BLOCK"),
        INS_TERMINATE_CARD_USAGE => Some("TERMINATE_CARD_USAGE"),
        _ => None,
    }
}

/// Risk contribution of an instruction, before capping.
fn instruction_risk(ins: u8) -> u32 {
    let mut score = match ins {
        INS_INTERNAL_AUTHENTICATE => 30,
        INS_WRITE_BINARY | INS_WRITE_BINARY_ODD | INS_UPDATE_BINARY => 20,
        INS_SELECT => 5,
        _ => 0,
    };
    if critical_operation(ins).is_some() {
        score += 80;
    }
    score
}

/// Analyzes one raw APDU travelling in `direction`.
///
/// # Arguments
///
/// * `raw` - The APDU bytes. Commands need at least 4, responses at least 2.
/// * `direction` - Command (toward the card) or response (toward the POS).
///
/// # Returns
///
/// The analysis, or a validation error if the frame is too short.
pub fn analyze(raw: &[u8], direction: ApduDirection) -> Result<ApduAnalysis> {
    match direction {
        ApduDirection::Command => analyze_command(raw),
        ApduDirection::Response => analyze_response(raw),
    }
}

fn analyze_command(raw: &[u8]) -> Result<ApduAnalysis> {
    if raw.len() < 4 {
        return Err(AppError::Validation(format!(
            "APDU command must be at least 4 bytes, got {}",
            raw.len()
        )));
    }

    let (cla, ins, p1, p2) = (raw[0], raw[1], raw[2], raw[3]);
    let class = classify_instruction(ins);
    let data = command_data(raw);

    let mut analysis = ApduAnalysis {
        command_class: Some(class),
        command_type: format!("CLA:{:02X},INS:{:02X},P1:{:02X},P2:{:02X}", cla, ins, p1, p2),
        critical_operation: critical_operation(ins).map(str::to_string),
        ..ApduAnalysis::default()
    };

    match class {
        // AIDs are not TLV
        CommandClass::Select => {
            if !data.is_empty() {
                let prefix = &data[..data.len().min(4)];
                analysis.application_id = Some(format!("AID_{}", hex::encode_upper(prefix)));
            }
        }
        _ if ins == INS_VERIFY => {
            analysis.pin = plaintext_pin(data);
        }
        _ => scan_tlv(data, &mut analysis, 0),
    }

    let mut risk = instruction_risk(ins);
    if analysis.pin.is_some() {
        risk += 10;
    }
    analysis.risk_score = risk.min(100) as u8;
    analysis.transaction_type = transaction_type(&analysis).to_string();
    Ok(analysis)
}

fn analyze_response(raw: &[u8]) -> Result<ApduAnalysis> {
    if raw.len() < 2 {
        return Err(AppError::Validation(format!(
            "APDU response must carry a status word, got {} bytes",
            raw.len()
        )));
    }

    let (body, sw) = raw.split_at(raw.len() - 2);
    let mut analysis = ApduAnalysis {
        command_class: Some(CommandClass::Response),
        command_type: format!("SW:{:02X}{:02X}", sw[0], sw[1]),
        ..ApduAnalysis::default()
    };
    scan_tlv(body, &mut analysis, 0);

    let mut risk = 0u32;
    if analysis.pan.is_some() {
        risk += 10;
    }
    analysis.risk_score = risk.min(100) as u8;
    analysis.transaction_type = transaction_type(&analysis).to_string();
    Ok(analysis)
}

fn transaction_type(analysis: &ApduAnalysis) -> &'static str {
    if analysis.amount.is_some() {
        return "PURCHASE";
    }
    match analysis.class() {
        CommandClass::Select => "APPLICATION_SELECTION",
        CommandClass::Read => "DATA_READ",
        CommandClass::Write => "DATA_WRITE",
        CommandClass::GetChallenge | CommandClass::InternalAuthenticate => "AUTHENTICATION",
        CommandClass::Response => "CARD_RESPONSE",
        CommandClass::Unknown => "CARD_COMMAND",
    }
}

/// The data field of a command APDU, short or extended length.
fn command_data(raw: &[u8]) -> &[u8] {
    if raw.len() <= 5 {
        return &[];
    }
    let lc = raw[4] as usize;
    if lc != 0 {
        return raw.get(5..5 + lc).unwrap_or(&raw[5..]);
    }
    // extended: 00 Lc1 Lc2
    if raw.len() > 7 {
        let lc = u16::from_be_bytes([raw[5], raw[6]]) as usize;
        return raw.get(7..7 + lc).unwrap_or(&raw[7..]);
    }
    &[]
}

/// Walks BER-TLV data, filling the EMV fields it recognises.
fn scan_tlv(data: &[u8], out: &mut ApduAnalysis, depth: u8) {
    let mut i = 0;
    while i < data.len() {
        let first = data[i];
        if first == 0x00 || first == 0xFF {
            i += 1;
            continue;
        }

        let mut tag = first as u32;
        i += 1;
        if first & 0x1F == 0x1F {
            loop {
                let Some(&b) = data.get(i) else { return };
                tag = (tag << 8) | b as u32;
                i += 1;
                if b & 0x80 == 0 || tag > 0x00FF_FFFF {
                    break;
                }
            }
        }

        let Some(&len_byte) = data.get(i) else { return };
        i += 1;
        let len = match len_byte {
            l if l < 0x80 => l as usize,
            0x81 => {
                let Some(&l) = data.get(i) else { return };
                i += 1;
                l as usize
            }
            0x82 => {
                let (Some(&hi), Some(&lo)) = (data.get(i), data.get(i + 1)) else {
                    return;
                };
                i += 2;
                u16::from_be_bytes([hi, lo]) as usize
            }
            _ => return,
        };

        let Some(value) = data.get(i..i + len) else { return };
        i += len;

        let constructed = first & 0x20 != 0;
        if constructed {
            if depth < MAX_TLV_DEPTH {
                scan_tlv(value, out, depth + 1);
            }
            continue;
        }

        match tag {
            TAG_PAN => out.pan = bcd_digits(value, true),
            TAG_AMOUNT_AUTHORISED => {
                out.amount = bcd_digits(value, false).and_then(|d| d.parse().ok());
            }
            TAG_CURRENCY_CODE => {
                out.currency = bcd_digits(value, false).map(|d| {
                    let start = d.len().saturating_sub(3);
                    d[start..].to_string()
                });
            }
            TAG_MERCHANT_CATEGORY => {
                out.merchant_category = bcd_digits(value, false).map(|d| merchant_category_name(&d));
            }
            _ => {}
        }
    }
}

/// Decodes packed BCD. With `f_padded`, a trailing `F` nibble ends the number.
fn bcd_digits(value: &[u8], f_padded: bool) -> Option<String> {
    let mut digits = String::with_capacity(value.len() * 2);
    for nibble in value.iter().flat_map(|b| [b >> 4, b & 0x0F]) {
        match nibble {
            0..=9 => digits.push(char::from(b'0' + nibble)),
            0x0F if f_padded => break,
            _ => return None,
        }
    }
    if digits.is_empty() { None } else { Some(digits) }
}

/// Names the merchant category codes the blacklist is expressed in.
pub fn merchant_category_name(mcc: &str) -> String {
    match mcc {
        "7995" | "7800" | "7801" | "7802" => "GAMBLING".to_string(),
        "5993" => "TOBACCO".to_string(),
        "5967" | "7273" => "ADULT".to_string(),
        other => format!("MCC_{}", other),
    }
}

/// PIN digits from a plaintext (format 2) VERIFY PIN block.
fn plaintext_pin(data: &[u8]) -> Option<String> {
    let (&control, rest) = data.split_first()?;
    if control >> 4 != 0x2 {
        return None;
    }
    let len = (control & 0x0F) as usize;
    let digits: String = rest
        .iter()
        .flat_map(|b| [b >> 4, b & 0x0F])
        .take(len)
        .take_while(|n| *n <= 9)
        .map(|n| char::from(b'0' + n))
        .collect();
    if digits.len() == len { Some(digits) } else { None }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_is_classified_with_its_aid() {
        let raw = hex::decode("00A4040008A000000003000000").unwrap();
        let a = analyze(&raw, ApduDirection::Command).unwrap();
        assert_eq!(a.class(), CommandClass::Select);
        assert_eq!(a.command_type, "CLA:00,INS:A4,P1:04,P2:00");
        assert_eq!(a.application_id.as_deref(), Some("AID_A0000000"));
        assert_eq!(a.risk_score, 5);
        assert_eq!(a.amount, None);
    }

    #[test]
    fn short_frames_are_rejected() {
        assert!(analyze(&[0x00, 0xA4, 0x04], ApduDirection::Command).is_err());
        assert!(analyze(&[0x90], ApduDirection::Response).is_err());
        assert!(analyze(&[0x90, 0x00], ApduDirection::Response).is_ok());
    }

    #[test]
    fn risk_is_weighted_and_capped() {
        let auth = analyze(&[0x00, 0x88, 0x00, 0x00], ApduDirection::Command).unwrap();
        assert_eq!(auth.class(), CommandClass::InternalAuthenticate);
        assert_eq!(auth.risk_score, 30);

        let put_key = analyze(&[0x84, 0xD8, 0x00, 0x00], ApduDirection::Command).unwrap();
        assert_eq!(put_key.critical_operation.as_deref(), Some("UPDATE_KEY"));
        assert!(put_key.risk_score <= 100);
    }

    #[test]
    fn amount_currency_and_merchant_come_from_tlv() {
        // 9F02 amount 5,000.00, 5F2A EUR, 9F15 7995
        let data = hex::decode("9F02060000005000005F2A0209789F15027995").unwrap();
        let mut raw = vec![0x80, 0xAE, 0x80, 0x00, data.len() as u8];
        raw.extend_from_slice(&data);
        raw.push(0x00);
        let a = analyze(&raw, ApduDirection::Command).unwrap();
        assert_eq!(a.amount, Some(500_000));
        assert_eq!(a.currency.as_deref(), Some("978"));
        assert_eq!(a.merchant_category.as_deref(), Some("GAMBLING"));
        assert_eq!(a.transaction_type, "PURCHASE");
    }

    #[test]
    fn pan_is_found_inside_a_record_template() {
        // 70 { 5A 08 4761739001010010 }, 9000
        let raw = hex::decode("700A5A0847617390010100109000").unwrap();
        let a = analyze(&raw, ApduDirection::Response).unwrap();
        assert_eq!(a.class(), CommandClass::Response);
        assert_eq!(a.command_type, "SW:9000");
        assert_eq!(a.pan.as_deref(), Some("4761739001010010"));
    }

    #[test]
    fn verify_pin_block_is_decoded() {
        let raw = hex::decode("0020008008241234FFFFFFFFFF").unwrap();
        let a = analyze(&raw, ApduDirection::Command).unwrap();
        assert_eq!(a.pin.as_deref(), Some("1234"));
    }

    #[test]
    fn malformed_tlv_is_ignored() {
        let raw = hex::decode("00B2010C055A09123400").unwrap();
        let a = analyze(&raw, ApduDirection::Command).unwrap();
        assert_eq!(a.class(), CommandClass::Read);
        assert_eq!(a.pan, None);
    }
}
