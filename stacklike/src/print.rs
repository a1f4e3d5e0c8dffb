use stanza::style::{HAlign, Header, MinWidth, Separator, Styles};
use stanza::table::{Col, Row, Table};

use crate::fit::{AsymmetricError, FitResult};

fn left(width: usize) -> Col {
    Col::new(Styles::default().with(MinWidth(width)).with(HAlign::Left))
}

fn right(width: usize) -> Col {
    Col::new(Styles::default().with(MinWidth(width)).with(HAlign::Right))
}

fn format_bound(bound: Option<f64>) -> String {
    bound.map_or_else(|| "-".into(), |bound| format!("{bound:.4}"))
}

fn format_relative(value: f64, err: f64) -> String {
    if value == 0.0 {
        "-".into()
    } else {
        format!("{:.2}", err / value.abs())
    }
}

/// Per-bin PSF against the reference template, with both error estimates.
pub fn tabulate_psf(result: &FitResult) -> Table {
    let mut table = Table::default()
        .with_cols(vec![
            left(12),
            right(8),
            right(8),
            right(8),
            right(8),
            Col::new(
                Styles::default()
                    .with(Separator(true))
                    .with(MinWidth(8))
                    .with(HAlign::Right),
            ),
        ])
        .with_row(Row::new(
            Styles::default().with(Header(true)),
            vec![
                "Bin (°)".into(),
                "PSF".into(),
                "Error".into(),
                "+".into(),
                "−".into(),
                "Model".into(),
            ],
        ));
    for (bin, pair) in result.edges.windows(2).enumerate() {
        let AsymmetricError { plus, minus } = result.psf_profile[bin];
        table.push_row(Row::new(
            Styles::default(),
            vec![
                format!("{:.3}–{:.3}", pair[0], pair[1]).into(),
                format!("{:.4}", result.psf[bin]).into(),
                format!("{:.4}", result.psf_err[bin]).into(),
                format_bound(plus).into(),
                format_bound(minus).into(),
                format!("{:.4}", result.psfm[bin]).into(),
            ],
        ));
    }
    table
}

/// Source strengths with their relative errors.
pub fn tabulate_sources(result: &FitResult) -> Table {
    let mut table = Table::default()
        .with_cols(vec![left(16), left(8), right(10), right(8)])
        .with_row(Row::new(
            Styles::default().with(Header(true)),
            vec![
                "Source".into(),
                "Component".into(),
                "Strength".into(),
                "Rel. err".into(),
            ],
        ));
    let mut push = |source: &str, component: &str, value: f64, err: f64| {
        table.push_row(Row::new(
            Styles::default(),
            vec![
                source.into(),
                component.into(),
                format!("{value:.0}").into(),
                format_relative(value, err).into(),
            ],
        ));
    };
    for pulsar in &result.pulsars {
        push(&pulsar.name, "psf", pulsar.strength, pulsar.strength_err);
    }
    for background in &result.backgrounds {
        push(&background.name, "psf", background.psf_strength, background.psf_strength_err);
        push(&background.name, "iso", background.iso_strength, background.iso_strength_err);
    }
    if let Some(halo) = &result.halo {
        push("", "halo", halo.strength, halo.strength_err);
    }
    table
}

/// Fitted background estimate per pulsar and bin.
pub fn tabulate_backgrounds(result: &FitResult) -> Table {
    let mut table = Table::default()
        .with_cols({
            let mut cols = vec![left(12)];
            for _ in &result.pulsars {
                cols.push(right(10));
                cols.push(right(8));
            }
            cols
        })
        .with_row({
            let mut header_cells = vec!["Bin (°)".into()];
            for pulsar in &result.pulsars {
                header_cells.push(pulsar.name.clone().into());
                header_cells.push("±".into());
            }
            Row::new(Styles::default().with(Header(true)), header_cells)
        });
    for (bin, pair) in result.edges.windows(2).enumerate() {
        let mut row_cells = vec![format!("{:.3}–{:.3}", pair[0], pair[1]).into()];
        for pulsar in &result.pulsars {
            row_cells.push(format!("{:.1}", pulsar.background[bin]).into());
            row_cells.push(format!("{:.1}", pulsar.background_err[bin]).into());
        }
        table.push_row(Row::new(Styles::default(), row_cells));
    }
    table
}
