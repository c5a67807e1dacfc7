// 🧾 E-Document Rules - Invoice / purchase order / delivery note reconciliation

use std::collections::{HashMap, HashSet};

use super::{display_id, format_amount, round2, round4, FixRecommendation, Issue, Severity, TOLERANCE};
use crate::loader::{Cell, DeliveryNoteRow, InvoiceRow, LoadedTable, PurchaseOrderRow};

pub const DUPLICATE_INVOICE: &str = "DUPLICATE_INVOICE";
pub const TOTAL_MISMATCH: &str = "TOTAL_MISMATCH";
pub const VAT_MISMATCH: &str = "VAT_MISMATCH";
pub const MISSING_PO: &str = "MISSING_PO";
pub const MISSING_DN: &str = "MISSING_DN";
pub const THREE_WAY_MISMATCH: &str = "THREE_WAY_MISMATCH";
pub const VENDOR_NOT_ALLOWED: &str = "VENDOR_NOT_ALLOWED";
pub const VAT_RATE_NOT_ALLOWED: &str = "VAT_RATE_NOT_ALLOWED";

/// Invoice fields the apply phase is allowed to overwrite.
pub const CORRECTABLE_FIELDS: &[&str] = &["total", "vat_amount"];

// ============================================================================
// DUPLICATES
// ============================================================================

fn duplicate_invoice_issue(invoice_id: &str) -> Issue {
    let id = display_id(invoice_id);
    Issue::new(
        format!("dup-{}", id),
        id.as_str(),
        Severity::High,
        DUPLICATE_INVOICE,
        format!("Duplicate invoice_id detected: {}", id),
    )
}

/// One issue per distinct repeated invoice id, in order of first appearance.
/// Repeated blank ids count as a duplicate of "(empty)".
pub fn find_duplicate_invoices(invoices: &[InvoiceRow]) -> Vec<Issue> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    let mut order: Vec<&str> = Vec::new();
    for invoice in invoices {
        let count = counts.entry(invoice.invoice_id.as_str()).or_insert(0);
        if *count == 0 {
            order.push(invoice.invoice_id.as_str());
        }
        *count += 1;
    }

    order
        .into_iter()
        .filter(|id| counts.get(id).copied().unwrap_or(0) > 1)
        .map(duplicate_invoice_issue)
        .collect()
}

// ============================================================================
// ARITHMETIC
// ============================================================================

/// total must equal round(subtotal + vat_amount, 2) within tolerance.
pub fn find_total_mismatch(invoices: &[InvoiceRow]) -> (Vec<Issue>, Vec<FixRecommendation>) {
    let mut issues = Vec::new();
    let mut fixes = Vec::new();

    for invoice in invoices {
        let subtotal = invoice.subtotal.unwrap_or(0.0);
        let vat_amount = invoice.vat_amount.unwrap_or(0.0);
        let total = invoice.total.unwrap_or(0.0);
        let expected = round2(subtotal + vat_amount);

        if (total - expected).abs() > TOLERANCE {
            issues.push(
                Issue::new(
                    format!("total-{}", invoice.invoice_id),
                    &invoice.invoice_id,
                    Severity::Medium,
                    TOTAL_MISMATCH,
                    format!("total={} expected={:.2}", format_amount(total), expected),
                )
                .with_suggested_fix(format!("Set total to {:.2}", expected)),
            );
            fixes.push(FixRecommendation {
                subject_id: invoice.invoice_id.clone(),
                field: "total".to_string(),
                suggested_value: expected,
                reason: "subtotal + vat_amount".to_string(),
            });
        }
    }

    (issues, fixes)
}

/// vat_amount must equal round(subtotal * vat_rate, 2) within tolerance.
pub fn find_vat_mismatch(invoices: &[InvoiceRow]) -> (Vec<Issue>, Vec<FixRecommendation>) {
    let mut issues = Vec::new();
    let mut fixes = Vec::new();

    for invoice in invoices {
        let subtotal = invoice.subtotal.unwrap_or(0.0);
        let vat_rate = invoice.vat_rate.unwrap_or(0.0);
        let vat_amount = invoice.vat_amount.unwrap_or(0.0);
        let expected = round2(subtotal * vat_rate);

        if (vat_amount - expected).abs() > TOLERANCE {
            issues.push(
                Issue::new(
                    format!("vat-{}", invoice.invoice_id),
                    &invoice.invoice_id,
                    Severity::Medium,
                    VAT_MISMATCH,
                    format!("vat_amount={} expected={:.2}", format_amount(vat_amount), expected),
                )
                .with_suggested_fix(format!("Set vat_amount to {:.2}", expected)),
            );
            fixes.push(FixRecommendation {
                subject_id: invoice.invoice_id.clone(),
                field: "vat_amount".to_string(),
                suggested_value: expected,
                reason: "subtotal * vat_rate".to_string(),
            });
        }
    }

    (issues, fixes)
}

// ============================================================================
// REFERENCES & THREE-WAY MATCH
// ============================================================================


/// PO and DN are checked independently; an empty reference counts as missing.
pub fn find_missing_references(
    invoices: &[InvoiceRow],
    purchase_orders: &[PurchaseOrderRow],
    delivery_notes: &[DeliveryNoteRow],
) -> Vec<Issue> {
    let po_ids: HashSet<&str> = purchase_orders.iter().map(|po| po.po_id.as_str()).collect();
    let dn_ids: HashSet<&str> = delivery_notes.iter().map(|dn| dn.dn_id.as_str()).collect();
    let mut issues = Vec::new();

    for invoice in invoices {
        if invoice.po_id.trim().is_empty() || !po_ids.contains(invoice.po_id.as_str()) {
            issues.push(Issue::new(
                format!("po-{}", invoice.invoice_id),
                &invoice.invoice_id,
                Severity::High,
                MISSING_PO,
                format!(
                    "po_id {} not found in purchase orders",
                    display_id(&invoice.po_id)
                ),
            ));
        }
        if invoice.dn_id.trim().is_empty() || !dn_ids.contains(invoice.dn_id.as_str()) {
            issues.push(Issue::new(
                format!("dn-{}", invoice.invoice_id),
                &invoice.invoice_id,
                Severity::High,
                MISSING_DN,
                format!(
                    "dn_id {} not found in delivery notes",
                    display_id(&invoice.dn_id)
                ),
            ));
        }
    }

    issues
}

/// Compare ordered vs delivered item counts for invoices whose PO and DN both
/// resolve. Unresolved links are skipped (the reference check reports them).
pub fn find_three_way_mismatch(
    invoices: &[InvoiceRow],
    purchase_orders: &[PurchaseOrderRow],
    delivery_notes: &[DeliveryNoteRow],
) -> Vec<Issue> {
    // Later rows win on repeated ids
    let po_counts: HashMap<&str, f64> = purchase_orders
        .iter()
        .map(|po| (po.po_id.as_str(), po.item_count.unwrap_or(0.0)))
        .collect();
    let dn_counts: HashMap<&str, f64> = delivery_notes
        .iter()
        .map(|dn| (dn.dn_id.as_str(), dn.delivered_item_count.unwrap_or(0.0)))
        .collect();

    invoices
        .iter()
        .filter_map(|invoice| {
            let ordered = po_counts.get(invoice.po_id.as_str())?;
            let delivered = dn_counts.get(invoice.dn_id.as_str())?;
            ((ordered - delivered).abs() > 0.0).then(|| {
                Issue::new(
                    format!("3way-{}", invoice.invoice_id),
                    &invoice.invoice_id,
                    Severity::Medium,
                    THREE_WAY_MISMATCH,
                    format!(
                        "po_items={} dn_items={}",
                        format_amount(*ordered),
                        format_amount(*delivered)
                    ),
                )
            })
        })
        .collect()
}

// ============================================================================
// ALLOWLISTS
// ============================================================================

/// Case-insensitive, trimmed vendor membership. An empty allowlist checks nothing.
pub fn find_unapproved_vendors(invoices: &[InvoiceRow], allowed_vendors: &[String]) -> Vec<Issue> {
    let allowed: HashSet<String> = allowed_vendors
        .iter()
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
        .collect();
    if allowed.is_empty() {
        return Vec::new();
    }

    invoices
        .iter()
        .filter_map(|invoice| {
            let vendor = invoice.vendor.trim();
            (!vendor.is_empty() && !allowed.contains(&vendor.to_lowercase())).then(|| {
                Issue::new(
                    format!("vendor-{}", invoice.invoice_id),
                    &invoice.invoice_id,
                    Severity::High,
                    VENDOR_NOT_ALLOWED,
                    format!("Vendor is not on the approved list: {}", vendor),
                )
            })
        })
        .collect()
}

/// Percent-style rates (1 < r <= 100) become fractions, then round to 4 places.
pub fn normalize_rate(rate: f64) -> f64 {
    if rate > 1.0 && rate <= 100.0 {
        round4(rate / 100.0)
    } else {
        round4(rate)
    }
}

fn rate_key(rate: f64) -> i64 {
    (normalize_rate(rate) * 10_000.0).round() as i64
}

pub fn find_disallowed_vat_rates(invoices: &[InvoiceRow], allowed_rates: &[f64]) -> Vec<Issue> {
    let allowed: HashSet<i64> = allowed_rates
        .iter()
        .filter(|r| r.is_finite())
        .map(|r| rate_key(*r))
        .collect();
    if allowed.is_empty() {
        return Vec::new();
    }

    invoices
        .iter()
        .filter_map(|invoice| {
            let rate = invoice.vat_rate?;
            (!allowed.contains(&rate_key(rate))).then(|| {
                Issue::new(
                    format!("vat-rate-{}", invoice.invoice_id),
                    &invoice.invoice_id,
                    Severity::Medium,
                    VAT_RATE_NOT_ALLOWED,
                    format!("VAT rate is not on the allowed list: {}", normalize_rate(rate)),
                )
            })
        })
        .collect()
}

// ============================================================================
// APPLY
// ============================================================================

/// Write recorded fixes into a loaded invoice table.
///
/// Only `total` and `vat_amount` are correctable; anything else is returned in
/// `skipped`. Every row matching the invoice id is updated.
pub fn apply_fixes(invoices: &mut LoadedTable, fixes: &[FixRecommendation]) -> AppliedFixes {
    let mut applied = AppliedFixes::default();
    let id_column = invoices.column_index("invoice_id");

    for fix in fixes {
        if !CORRECTABLE_FIELDS.contains(&fix.field.as_str()) {
            applied.skipped.push(fix.clone());
            continue;
        }

        let matching: Vec<usize> = invoices
            .rows
            .iter()
            .enumerate()
            .filter(|(_, cells)| {
                id_column
                    .and_then(|col| cells.get(col))
                    .is_some_and(|cell| cell.to_string() == fix.subject_id)
            })
            .map(|(index, _)| index)
            .collect();

        for index in &matching {
            invoices.set(*index, &fix.field, Cell::Number(fix.suggested_value));
        }
        applied.notes.push(format!(
            "{} -> {}={:.2}",
            fix.subject_id, fix.field, fix.suggested_value
        ));
        applied.rows_updated += matching.len();
    }

    applied
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct AppliedFixes {
    /// "INV-1 -> total=118.00"
    pub notes: Vec<String>,
    pub skipped: Vec<FixRecommendation>,
    pub rows_updated: usize,
}

// ============================================================================
// TESTS
// ============================================================================
