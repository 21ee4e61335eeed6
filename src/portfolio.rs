use crate::holding::{EnrichedHolding, Holding};
use piechart::{Chart, Color};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Summary figures derived from a list of holdings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PortfolioMetrics {
    /// Sum of buy price times quantity.
    pub total_value: Decimal,
    /// Ticker with the largest buy price times quantity; `None` for an empty portfolio.
    pub top_holding: Option<String>,
    /// Buy price per ticker.
    pub distribution: BTreeMap<String, Decimal>,
}

impl PortfolioMetrics {
    pub fn top_holding_label(&self) -> &str {
        self.top_holding.as_deref().unwrap_or("N/A")
    }
}

/// Where the views take their headline metrics from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricsSource {
    /// Recomputed from the holdings snapshot.
    #[default]
    Local,
    /// As reported by `/api/portfolio/metrics`.
    Remote,
}

/// Compute metrics over `holdings` in order.
///
/// Ties for the top holding go to the earlier entry. A repeated ticker keeps the
/// price of its last occurrence in the distribution. An empty input yields a zero
/// total, no top holding and an empty distribution. The total saturates at
/// `Decimal::MAX`.
pub fn aggregate<H: AsRef<Holding>>(holdings: &[H]) -> PortfolioMetrics {
    let mut total_value = Decimal::ZERO;
    let mut top: Option<(&str, Decimal)> = None;
    let mut distribution = BTreeMap::new();

    for holding in holdings.iter().map(AsRef::as_ref) {
        let value = holding.cost_basis();
        total_value = total_value.saturating_add(value);

        match top {
            Some((_, max)) if value <= max => {}
            _ => top = Some((&holding.ticker_symbol, value)),
        }

        distribution.insert(holding.ticker_symbol.clone(), holding.price);
    }

    PortfolioMetrics {
        total_value,
        top_holding: top.map(|(ticker, _)| ticker.to_string()),
        distribution,
    }
}

// Print the holdings as a table
pub fn print_holdings(holdings: &[EnrichedHolding], include_sum: bool) {
    use comfy_table::{
        presets::UTF8_FULL, Attribute, Cell, CellAlignment, Color as TColor, ContentArrangement,
        Table,
    };

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_width(120);

    table.set_header(vec![
        Cell::new("Stock").add_attribute(Attribute::Bold),
        Cell::new("Ticker").add_attribute(Attribute::Bold),
        Cell::new("Quantity").add_attribute(Attribute::Bold),
        Cell::new("Buy Price").add_attribute(Attribute::Bold),
        Cell::new("Current Price").add_attribute(Attribute::Bold),
        Cell::new("Profit/Loss").add_attribute(Attribute::Bold),
        Cell::new("Value").add_attribute(Attribute::Bold),
    ]);

    let pnl_cell = |v: Decimal| {
        let c = if v >= Decimal::ZERO {
            TColor::Green
        } else {
            TColor::Red
        };
        Cell::new(format_signed(v))
            .set_alignment(CellAlignment::Right)
            .fg(c)
    };

    let mut total_cost = Decimal::ZERO;
    let mut total_value = Decimal::ZERO;
    let mut total_pnl = Decimal::ZERO;
    for position in holdings {
        let holding = &position.holding;
        total_cost = total_cost.saturating_add(holding.cost_basis());
        total_value = total_value.saturating_add(position.market_value());
        total_pnl = total_pnl.saturating_add(position.total_profit_or_loss());

        table.add_row(vec![
            Cell::new(&holding.company_name),
            Cell::new(&holding.ticker_symbol).fg(TColor::DarkBlue),
            Cell::new(holding.quantity).set_alignment(CellAlignment::Right),
            Cell::new(format!("${:.2}", holding.price)).set_alignment(CellAlignment::Right),
            Cell::new(format!("${:.2}", position.current_price))
                .set_alignment(CellAlignment::Right),
            pnl_cell(position.profit_or_loss),
            Cell::new(format!("{:.2}", position.market_value()))
                .set_alignment(CellAlignment::Right),
        ]);
    }

    if include_sum {
        table.add_row(vec![
            Cell::new("TOTAL").add_attribute(Attribute::Bold),
            Cell::new(""),
            Cell::new(""),
            Cell::new(format!("{total_cost:.2}"))
                .set_alignment(CellAlignment::Right)
                .add_attribute(Attribute::Bold),
            Cell::new(""),
            pnl_cell(total_pnl).add_attribute(Attribute::Bold),
            Cell::new(format!("{total_value:.2}"))
                .set_alignment(CellAlignment::Right)
                .add_attribute(Attribute::Bold),
        ]);
    }

    println!("{table}");
}

pub fn print_metrics(metrics: &PortfolioMetrics) {
    println!("====================================");
    println!("{: >16} | {:.2}", "Total value", metrics.total_value);
    println!("{: >16} | {}", "Top holding", metrics.top_holding_label());
    println!("====================================");
    for (ticker, price) in &metrics.distribution {
        println!("{ticker: >16} | {price: >10.2}");
    }
}

pub fn draw_pie_chart(metrics: &PortfolioMetrics) {
    let colors = [
        Color::Red,
        Color::Green,
        Color::Blue,
        Color::Yellow,
        Color::Cyan,
        Color::White,
        Color::Purple,
        Color::Black,
    ];

    let data: Vec<piechart::Data> = metrics
        .distribution
        .iter()
        .enumerate()
        .map(|(i, (ticker, price))| piechart::Data {
            label: ticker.to_string(),
            value: price.to_f32().unwrap_or(0.0),
            color: Some(colors[i % colors.len()].into()),
            fill: '•',
        })
        .collect();

    if data.is_empty() {
        return;
    }

    Chart::new()
        .legend(true)
        .radius(9)
        .aspect_ratio(3)
        .draw(&data);
}

pub fn format_signed(value: Decimal) -> String {
    if value >= Decimal::ZERO {
        format!("+{value:.2}")
    } else {
        format!("{value:.2}")
    }
}
