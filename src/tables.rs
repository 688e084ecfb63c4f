use crate::aggregator::{ColumnSeries, SimilarityRow};
use crate::candles::CandleTable;
use crate::config::IndicatorConfig;
use crate::models::MarketListing;
use crate::movers::MoversReport;
use crate::options::OptionRow;
use crate::pairs::{CorrelationMatrix, PairTrade};
use crate::storage_utils::format_timestamp;
use chrono::DateTime;
use comfy_table::{
    Attribute, Cell, CellAlignment, Color, ContentArrangement, Table, modifiers::UTF8_ROUND_CORNERS,
    presets::UTF8_BORDERS_ONLY,
};

fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_BORDERS_ONLY)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(
            headers
                .iter()
                .map(|h| Cell::new(h).add_attribute(Attribute::Bold))
                .collect::<Vec<_>>(),
        );
    table
}

fn number(value: Option<f64>, decimals: usize) -> Cell {
    let text = match value {
        Some(v) => format!("{:.*}", decimals, v),
        None => "-".to_string(),
    };
    Cell::new(text).set_alignment(CellAlignment::Right)
}

fn signed(value: Option<f64>, decimals: usize, suffix: &str) -> Cell {
    let Some(v) = value else {
        return number(None, decimals);
    };
    let color = if v >= 0.0 { Color::Green } else { Color::Red };
    Cell::new(format!("{:.*}{}", decimals, v, suffix))
        .fg(color)
        .set_alignment(CellAlignment::Right)
}

fn rsi_cell(rsi: Option<f64>, thresholds: &IndicatorConfig) -> Cell {
    let cell = number(rsi, 1);
    match rsi {
        Some(v) if v >= thresholds.rsi_overbought => cell.fg(Color::Red),
        Some(v) if v <= thresholds.rsi_oversold => cell.fg(Color::Green),
        _ => cell,
    }
}

fn get_visibility_ratio(current_pct: f64, top_pct: f64) -> f64 {
    (0.4 + 0.6 * (current_pct / top_pct)).max(0.4)
}

/// The last `tail` rows of a candle table.
pub fn candles_table(table: &CandleTable, tail: usize, thresholds: &IndicatorConfig, utc_offset_hours: i32) -> String {
    let ema_windows: Vec<usize> = table
        .rows
        .first()
        .map(|r| r.emas.iter().map(|e| e.window).collect())
        .unwrap_or_default();

    let mut headers = vec![
        "Time".to_string(),
        "Close".to_string(),
        "Change %".to_string(),
        "Volume".to_string(),
        "Rel Vol".to_string(),
        "RSI".to_string(),
    ];
    headers.extend(ema_windows.iter().map(|w| format!("EMA {} %", w)));
    headers.push("VWAP %".to_string());
    let header_refs: Vec<&str> = headers.iter().map(String::as_str).collect();

    let mut out = new_table(&header_refs);
    let skip = table.rows.len().saturating_sub(tail);
    for row in table.rows.iter().skip(skip) {
        let mut cells = vec![
            Cell::new(format_timestamp(row.candle.timestamp, utc_offset_hours)).fg(Color::DarkGrey),
            number(Some(row.candle.close), 4),
            signed(row.change, 2, "%"),
            number(Some(row.volume), 0),
            number(row.relative_volume, 2),
            rsi_cell(row.rsi, thresholds),
        ];
        cells.extend(ema_windows.iter().map(|w| signed(row.column(&format!("spread_{}", w)), 2, "%")));
        cells.push(signed(row.vwap_spread, 2, "%"));
        out.add_row(cells);
    }

    let symbol = table.symbol.as_deref().unwrap_or(&table.ticker);
    let last = table.last("close").map(|c| format!(" @ {}", c)).unwrap_or_default();
    format!("{} {}{}\n{}", table.exchange, symbol, last, out)
}

pub fn movers_table(report: &MoversReport, top: usize, thresholds: &IndicatorConfig, utc_offset_hours: i32) -> String {
    let time_str = DateTime::from_timestamp_millis(report.last_updated_timestamp)
        .map(|ts| format_timestamp(ts, utc_offset_hours))
        .unwrap_or_else(|| "Unknown Time".to_string());
    let title = format!("(Data taken at {}, UTC{:+})", time_str, utc_offset_hours);

    let mut table = new_table(&["Rank", "Asset", "Total Movement (%)", "RSI", "Rel Vol"]);

    let top_mover_pct = report.results.first().map(|r| r.movement_pct).unwrap_or(1.0);
    let safe_top_pct = if top_mover_pct == 0.0 { 1.0 } else { top_mover_pct };

    for (rank, asset) in report.results.iter().take(top).enumerate() {
        let ratio = get_visibility_ratio(asset.movement_pct, safe_top_pct);
        let cyan_val = (255.0 * ratio) as u8;
        let green_val = (255.0 * ratio) as u8;

        let pct_cell = Cell::new(format!("{:.2}%", asset.movement_pct))
            .fg(Color::Rgb {
                r: 0,
                g: green_val,
                b: 0,
            })
            .set_alignment(CellAlignment::Right);

        table.add_row(vec![
            Cell::new(rank + 1).fg(Color::DarkGrey),
            Cell::new(&asset.symbol).fg(Color::Rgb {
                r: 0,
                g: cyan_val,
                b: cyan_val,
            }),
            pct_cell,
            rsi_cell(asset.rsi, thresholds),
            number(asset.relative_volume, 2),
        ]);
    }

    format!("\n{}\n{}", title, table)
}

pub fn markets_table(markets: &[MarketListing]) -> String {
    let mut table = new_table(&["Exchange", "Symbol", "Id", "Base", "Quote", "Price"]);
    for m in markets {
        table.add_row(vec![
            Cell::new(&m.exchange_name).fg(Color::DarkGrey),
            Cell::new(&m.symbol).fg(Color::Cyan),
            Cell::new(&m.id),
            Cell::new(&m.base),
            Cell::new(&m.quote),
            number(m.price, 6),
        ]);
    }
    table.to_string()
}

pub fn similarity_table(base_ticker: &str, rows: &[SimilarityRow]) -> String {
    let mut table = new_table(&["Exchange", "Ticker", "Similarity"]);
    for row in rows {
        table.add_row(vec![
            Cell::new(&row.exchange).fg(Color::DarkGrey),
            Cell::new(&row.ticker).fg(Color::Cyan),
            number(row.score, 4),
        ]);
    }
    format!("Similarity to {}\n{}", base_ticker.to_uppercase(), table)
}

/// Last value of every series, one row per ticker and exchange.
pub fn columns_table(series: &[ColumnSeries]) -> String {
    let mut columns: Vec<&str> = Vec::new();
    let mut keys: Vec<(&str, &str)> = Vec::new();
    for s in series {
        if !columns.contains(&s.column.as_str()) {
            columns.push(&s.column);
        }
        let key = (s.ticker.as_str(), s.exchange.as_str());
        if !keys.contains(&key) {
            keys.push(key);
        }
    }

    let mut headers = vec!["Ticker", "Exchange"];
    headers.extend(columns.iter().copied());
    let mut table = new_table(&headers);

    for (ticker, exchange) in keys {
        let mut cells = vec![Cell::new(ticker).fg(Color::Cyan), Cell::new(exchange).fg(Color::DarkGrey)];
        cells.extend(columns.iter().map(|column| {
            let last = series
                .iter()
                .find(|s| s.ticker == ticker && s.exchange == exchange && s.column == *column)
                .and_then(ColumnSeries::last);
            if column.starts_with("traj_") {
                signed(last, 4, "")
            } else {
                number(last, 4)
            }
        }));
        table.add_row(cells);
    }
    table.to_string()
}

pub fn option_table(rows: &[OptionRow]) -> String {
    let mut table = new_table(&[
        "Contract", "Type", "Strike", "Expiration", "DTE", "Spot", "Price", "Theo", "IV", "Delta", "Intrinsic",
        "Extrinsic",
    ]);
    for row in rows {
        let c = &row.contract;
        table.add_row(vec![
            Cell::new(&c.symbol).fg(Color::Cyan),
            Cell::new(c.option_type),
            number(Some(c.strike), 2),
            Cell::new(c.expiration.format("%Y-%m-%d")),
            number(Some(row.dte as f64), 0),
            number(Some(row.spot), 2),
            number(Some(row.market_price), 2),
            number(Some(row.theoretical_price), 2),
            number(row.implied_volatility.map(|iv| iv * 100.0), 1),
            signed(Some(row.delta), 3, ""),
            number(Some(row.intrinsic), 2),
            number(Some(row.extrinsic), 2),
        ]);
    }
    table.to_string()
}

pub fn correlation_table(matrix: &CorrelationMatrix) -> String {
    let mut headers = vec![""];
    headers.extend(matrix.tickers.iter().map(String::as_str));
    let mut table = new_table(&headers);

    for a in &matrix.tickers {
        let mut cells = vec![Cell::new(a).add_attribute(Attribute::Bold)];
        cells.extend(matrix.tickers.iter().map(|b| signed(matrix.get(a, b), 2, "")));
        table.add_row(cells);
    }
    table.to_string()
}

pub fn pair_table(trade: &PairTrade) -> String {
    let mut table = new_table(&["", trade.base_ticker.as_str(), trade.compare_ticker.as_str()]);
    table
        .add_row(vec![
            Cell::new("Previous"),
            signed(Some(trade.b_change * 100.0), 2, "%"),
            signed(Some(trade.c_change * 100.0), 2, "%"),
        ])
        .add_row(vec![
            Cell::new("Next"),
            signed(Some(trade.b_current_change * 100.0), 2, "%"),
            signed(Some(trade.expected_compare_change * 100.0), 2, "%"),
        ]);
    format!(
        "{}\nMultiplier {:.3}, last {:.2}, expected {:.2}",
        table, trade.multiplier, trade.last_price, trade.expected_price
    )
}

pub fn exchanges_table(names: &[&str]) -> String {
    let mut table = new_table(&["Exchange", "Free OHLCV"]);
    for name in names {
        table.add_row(vec![Cell::new(name).fg(Color::Cyan), Cell::new("yes").fg(Color::Green)]);
    }
    table.to_string()
}
