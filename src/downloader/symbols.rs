// =============================================================================
// Symbol normalization + volume-ranked symbol selection
// =============================================================================
//
// Canonical internal form is the concatenated `{BASE}{QUOTE}` pair. Inputs in
// `BASE/QUOTE`, `BASE-QUOTE`, or `BASE-QUOTE-SWAP` are parsed by stripping
// the swap marker and splitting on the separator; a concatenated string is
// split by greedily peeling a known quote currency off the end.
// =============================================================================

use tracing::{debug, info, warn};

use crate::binance::Ticker24h;

/// Known quote currencies, tried in order when splitting concatenated pairs.
pub const QUOTE_CURRENCIES: [&str; 7] = ["USDT", "USDC", "BUSD", "USD", "BTC", "ETH", "BNB"];

/// Bases that make a pair a stablecoin pair (excluded from top-N selection).
pub const STABLECOIN_BASES: [&str; 9] = [
    "USDT", "USDC", "BUSD", "DAI", "TUSD", "USDP", "FDUSD", "EUR", "GBP",
];

/// Leveraged-token base suffixes (excluded from top-N selection).
pub const LEVERAGED_SUFFIXES: [&str; 8] = ["UP", "DOWN", "BULL", "BEAR", "3L", "3S", "2L", "2S"];

/// A symbol split into its components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSymbol {
    pub base: String,
    pub quote: String,
    /// True when the input carried an explicit perpetual marker (`-SWAP`).
    pub perpetual: bool,
}

/// Parse any recognised symbol form.
pub fn parse(symbol: &str) -> Option<ParsedSymbol> {
    let raw = symbol.trim().to_uppercase();
    if raw.is_empty() {
        return None;
    }

    let (body, perpetual) = match raw.strip_suffix("-SWAP") {
        Some(stripped) => (stripped.to_string(), true),
        None => (raw, false),
    };

    // Separator forms: BASE/QUOTE and BASE-QUOTE.
    for sep in ['/', '-'] {
        if let Some((base, quote)) = body.split_once(sep) {
            if base.is_empty() || quote.is_empty() {
                return None;
            }
            return Some(ParsedSymbol {
                base: base.to_string(),
                quote: quote.to_string(),
                perpetual,
            });
        }
    }

    // Concatenated form: peel a known quote currency from the end.
    for quote in QUOTE_CURRENCIES {
        if let Some(base) = body.strip_suffix(quote) {
            if !base.is_empty() {
                return Some(ParsedSymbol {
                    base: base.to_string(),
                    quote: quote.to_string(),
                    perpetual,
                });
            }
        }
    }

    warn!(symbol, "unrecognised symbol form");
    None
}

/// Canonical internal form: `{BASE}{QUOTE}`.
pub fn to_internal(symbol: &str) -> Option<String> {
    parse(symbol).map(|p| format!("{}{}", p.base, p.quote))
}

/// CCXT form: `BASE/QUOTE`.
pub fn to_ccxt(symbol: &str) -> Option<String> {
    parse(symbol).map(|p| format!("{}/{}", p.base, p.quote))
}

/// OKX form: `BASE-QUOTE`, with `-SWAP` appended for perpetuals. An input
/// that already carried the swap marker keeps it.
pub fn to_okx(symbol: &str, perpetual: bool) -> Option<String> {
    parse(symbol).map(|p| {
        if perpetual || p.perpetual {
            format!("{}-{}-SWAP", p.base, p.quote)
        } else {
            format!("{}-{}", p.base, p.quote)
        }
    })
}

/// True when the pair's base is itself a stablecoin (or fiat proxy).
pub fn is_stablecoin_pair(symbol: &str) -> bool {
    parse(symbol).is_some_and(|p| STABLECOIN_BASES.contains(&p.base.as_str()))
}

/// True when the base carries a leveraged-token suffix.
pub fn is_leveraged_token(symbol: &str) -> bool {
    parse(symbol).is_some_and(|p| {
        LEVERAGED_SUFFIXES
            .iter()
            .any(|suffix| p.base.ends_with(suffix))
    })
}

// ---------------------------------------------------------------------------
// Top-N selection
// ---------------------------------------------------------------------------

/// Select the top `n` symbols by 24-hour quote volume, filtered to the given
/// quote currency, excluding stablecoin-base and leveraged-token pairs and
/// anything under the volume floor.
pub fn select_top_symbols(
    tickers: &[Ticker24h],
    n: usize,
    quote: &str,
    min_quote_volume: f64,
) -> Vec<String> {
    let mut eligible: Vec<&Ticker24h> = tickers
        .iter()
        .filter(|t| {
            let Some(parsed) = parse(&t.symbol) else {
                return false;
            };
            if parsed.quote != quote {
                return false;
            }
            if is_stablecoin_pair(&t.symbol) {
                debug!(symbol = %t.symbol, "excluded: stablecoin base");
                return false;
            }
            if is_leveraged_token(&t.symbol) {
                debug!(symbol = %t.symbol, "excluded: leveraged token");
                return false;
            }
            t.quote_volume >= min_quote_volume
        })
        .collect();

    eligible.sort_by(|a, b| {
        b.quote_volume
            .partial_cmp(&a.quote_volume)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let selected: Vec<String> = eligible
        .into_iter()
        .take(n)
        .map(|t| t.symbol.clone())
        .collect();
    info!(
        requested = n,
        selected = selected.len(),
        "top symbols selected by 24h quote volume"
    );
    selected
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_recognised_form() {
        let concat = parse("BTCUSDT").unwrap();
        assert_eq!((concat.base.as_str(), concat.quote.as_str()), ("BTC", "USDT"));
        assert!(!concat.perpetual);

        let ccxt = parse("BTC/USDT").unwrap();
        assert_eq!((ccxt.base.as_str(), ccxt.quote.as_str()), ("BTC", "USDT"));

        let okx = parse("BTC-USDT").unwrap();
        assert_eq!((okx.base.as_str(), okx.quote.as_str()), ("BTC", "USDT"));

        let swap = parse("BTC-USDT-SWAP").unwrap();
        assert!(swap.perpetual);
        assert_eq!((swap.base.as_str(), swap.quote.as_str()), ("BTC", "USDT"));
    }

    #[test]
    fn quote_peel_is_ordered() {
        // USDT must peel before USD for concatenated pairs.
        let p = parse("ETHUSDT").unwrap();
        assert_eq!(p.quote, "USDT");
        let p = parse("ETHUSD").unwrap();
        assert_eq!(p.quote, "USD");
        let p = parse("SOLBNB").unwrap();
        assert_eq!(p.quote, "BNB");
    }

    #[test]
    fn lowercase_and_whitespace_are_normalised() {
        assert_eq!(to_internal(" btc/usdt "), Some("BTCUSDT".to_string()));
    }

    #[test]
    fn unparseable_inputs_are_none() {
        assert_eq!(parse(""), None);
        assert_eq!(parse("XYZ"), None);
        assert_eq!(parse("/USDT"), None);
    }

    #[test]
    fn round_trip_is_idempotent() {
        for form in ["BTCUSDT", "BTC/USDT", "BTC-USDT", "BTC-USDT-SWAP", "ethusdt"] {
            let internal = to_internal(form).unwrap();
            let rebuilt = to_internal(&to_ccxt(&internal).unwrap()).unwrap();
            assert_eq!(rebuilt, internal, "round trip failed for {form}");
        }
    }

    #[test]
    fn conversions_target_each_format() {
        assert_eq!(to_ccxt("BTCUSDT"), Some("BTC/USDT".to_string()));
        assert_eq!(to_okx("BTC/USDT", false), Some("BTC-USDT".to_string()));
        assert_eq!(to_okx("BTCUSDT", true), Some("BTC-USDT-SWAP".to_string()));
        // The swap marker survives a format round trip.
        assert_eq!(
            to_okx("BTC-USDT-SWAP", false),
            Some("BTC-USDT-SWAP".to_string())
        );
    }

    #[test]
    fn classification_helpers() {
        assert!(is_stablecoin_pair("USDCUSDT"));
        assert!(!is_stablecoin_pair("BTCUSDT"));
        assert!(is_leveraged_token("BTCUPUSDT"));
        assert!(is_leveraged_token("ETHBULLUSDT"));
        assert!(is_leveraged_token("SOL3LUSDT"));
        assert!(!is_leveraged_token("BTCUSDT"));
    }

    fn ticker(symbol: &str, volume: f64) -> Ticker24h {
        Ticker24h {
            symbol: symbol.to_string(),
            quote_volume: volume,
            last_price: 1.0,
            price_change_pct: 0.0,
        }
    }

    #[test]
    fn top_selection_filters_and_ranks() {
        let tickers = vec![
            ticker("BTCUSDT", 9_000_000.0),
            ticker("ETHUSDT", 8_000_000.0),
            ticker("USDCUSDT", 50_000_000.0), // stablecoin base: out
            ticker("BTCUPUSDT", 7_000_000.0), // leveraged: out
            ticker("DOGEUSDT", 500_000.0),    // below volume floor: out
            ticker("SOLBTC", 6_000_000.0),    // wrong quote: out
            ticker("XRPUSDT", 8_500_000.0),
        ];

        let top = select_top_symbols(&tickers, 2, "USDT", 1_000_000.0);
        assert_eq!(top, vec!["BTCUSDT".to_string(), "XRPUSDT".to_string()]);
    }

    #[test]
    fn top_selection_takes_all_when_n_exceeds_eligible() {
        let tickers = vec![ticker("BTCUSDT", 2_000_000.0)];
        let top = select_top_symbols(&tickers, 10, "USDT", 1_000_000.0);
        assert_eq!(top.len(), 1);
    }
}
