// 📐 Schema Registry - Shape of every input table
// Declares, per (document type, table), the required/optional columns and their type.
// Pure data: no I/O, no dependencies.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::EngineError;

// ============================================================================
// SEMANTIC TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SemanticType {
    String,
    Number,
    Date,
}

impl SemanticType {
    pub fn name(&self) -> &'static str {
        match self {
            SemanticType::String => "string",
            SemanticType::Number => "number",
            SemanticType::Date => "date",
        }
    }
}

// ============================================================================
// DOCUMENT TYPES & TABLES
// ============================================================================

/// Which rule set a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentType {
    #[serde(rename = "ticket")]
    Ticket,
    #[serde(rename = "edoc")]
    EDocument,
}

impl DocumentType {
    pub fn code(&self) -> &'static str {
        match self {
            DocumentType::Ticket => "ticket",
            DocumentType::EDocument => "edoc",
        }
    }

    /// Schema-bound tables this document type needs, in load order.
    pub fn tables(&self) -> &'static [TableKind] {
        match self {
            DocumentType::Ticket => &[TableKind::Tickets],
            DocumentType::EDocument => &[
                TableKind::Invoices,
                TableKind::PurchaseOrders,
                TableKind::DeliveryNotes,
            ],
        }
    }

    /// Reference lists that enable optional checks when supplied.
    pub fn optional_inputs(&self) -> &'static [&'static str] {
        match self {
            DocumentType::Ticket => &[],
            DocumentType::EDocument => &[VENDORS_INPUT, ALLOWED_VAT_RATES_INPUT],
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for DocumentType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "ticket" => Ok(DocumentType::Ticket),
            "edoc" => Ok(DocumentType::EDocument),
            other => Err(EngineError::UnknownDocumentType(other.to_string())),
        }
    }
}

pub const VENDORS_INPUT: &str = "vendors";
pub const ALLOWED_VAT_RATES_INPUT: &str = "allowed_vat_rates";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    Tickets,
    Invoices,
    PurchaseOrders,
    DeliveryNotes,
}

impl TableKind {
    /// Input name used for uploads, mapping.json keys and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            TableKind::Tickets => "tickets",
            TableKind::Invoices => "invoices",
            TableKind::PurchaseOrders => "purchase_orders",
            TableKind::DeliveryNotes => "delivery_notes",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "tickets" => Some(TableKind::Tickets),
            "invoices" => Some(TableKind::Invoices),
            "purchase_orders" => Some(TableKind::PurchaseOrders),
            "delivery_notes" => Some(TableKind::DeliveryNotes),
            _ => None,
        }
    }

    pub fn schema(&self) -> &'static InputSchema {
        match self {
            TableKind::Tickets => &TICKETS,
            TableKind::Invoices => &INVOICES,
            TableKind::PurchaseOrders => &PURCHASE_ORDERS,
            TableKind::DeliveryNotes => &DELIVERY_NOTES,
        }
    }

    /// Alternative header spellings per expected column (English + Turkish).
    pub fn synonyms(&self) -> Synonyms {
        let table: &[(&str, &[&str])] = match self {
            TableKind::Tickets => TICKET_SYNONYMS,
            TableKind::Invoices => INVOICE_SYNONYMS,
            TableKind::PurchaseOrders => PURCHASE_ORDER_SYNONYMS,
            TableKind::DeliveryNotes => DELIVERY_NOTE_SYNONYMS,
        };
        table
            .iter()
            .map(|(column, alternatives)| {
                (
                    column.to_string(),
                    alternatives.iter().map(|a| a.to_string()).collect(),
                )
            })
            .collect()
    }
}

pub type Synonyms = BTreeMap<String, Vec<String>>;

// ============================================================================
// INPUT SCHEMA
// ============================================================================

/// Ordered column declarations. Immutable, one per (document type, table).
#[derive(Debug, PartialEq, Eq)]
pub struct InputSchema {
    pub table: &'static str,
    pub required: &'static [(&'static str, SemanticType)],
    pub optional: &'static [(&'static str, SemanticType)],
}

impl InputSchema {
    /// Required columns followed by optional ones.
    pub fn all_columns(&self) -> impl Iterator<Item = (&'static str, SemanticType)> + '_ {
        self.required.iter().chain(self.optional.iter()).copied()
    }

    pub fn column_names(&self) -> Vec<&'static str> {
        self.all_columns().map(|(name, _)| name).collect()
    }
}

use SemanticType::{Date, Number, String as Text};

static TICKETS: InputSchema = InputSchema {
    table: "tickets",
    required: &[
        ("ticket_id", Text),
        ("created_at", Date),
        ("channel", Text),
        ("customer_text", Text),
    ],
    optional: &[("category", Text), ("order_id", Text), ("amount", Number)],
};

static INVOICES: InputSchema = InputSchema {
    table: "invoices",
    required: &[
        ("invoice_id", Text),
        ("vendor", Text),
        ("date", Date),
        ("subtotal", Number),
        ("vat_rate", Number),
        ("vat_amount", Number),
        ("total", Number),
        ("po_id", Text),
        ("dn_id", Text),
    ],
    optional: &[],
};

static PURCHASE_ORDERS: InputSchema = InputSchema {
    table: "purchase_orders",
    required: &[
        ("po_id", Text),
        ("item_count", Number),
        ("total_expected", Number),
    ],
    optional: &[],
};

static DELIVERY_NOTES: InputSchema = InputSchema {
    table: "delivery_notes",
    required: &[("dn_id", Text), ("delivered_item_count", Number)],
    optional: &[],
};

// ============================================================================
// SYNONYMS
// ============================================================================

const TICKET_SYNONYMS: &[(&str, &[&str])] = &[
    ("ticket_id", &["ticketid", "id", "caseid", "requestid", "talepid", "kayitid"]),
    (
        "created_at",
        &["created", "createdat", "date", "timestamp", "olusturmatarihi", "tarih", "createdtime"],
    ),
    ("channel", &["channel", "source", "platform", "kanal", "kaynak"]),
    (
        "customer_text",
        &["text", "message", "body", "description", "detail", "aciklama", "icerik", "musterimesaji"],
    ),
    ("amount", &["amount", "price", "total", "tutar", "ucret", "bedel"]),
    ("order_id", &["orderid", "orderno", "siparisid", "siparisno"]),
    ("category", &["category", "kategori", "tur", "type"]),
];

const INVOICE_SYNONYMS: &[(&str, &[&str])] = &[
    ("invoice_id", &["invoiceid", "invoiceno", "faturano", "faturaid", "belgeno"]),
    ("vendor", &["vendor", "supplier", "satici", "tedarikci", "firma"]),
    ("date", &["date", "tarih", "invoice_date", "faturatarihi"]),
    ("subtotal", &["subtotal", "linetotal", "net", "satirtutari"]),
    ("vat_rate", &["vatrate", "kdv", "kdvorani", "taxrate"]),
    ("vat_amount", &["vatamount", "kdvtutari", "kdv_tutar"]),
    ("total", &["total", "tutar", "toplam", "grandtotal"]),
    ("po_id", &["poid", "purchaseorder", "siparisno", "satinalmasiparisno"]),
    ("dn_id", &["deliveryid", "irsaliyeno", "deliveryno", "dnid"]),
];

const PURCHASE_ORDER_SYNONYMS: &[(&str, &[&str])] = &[
    ("po_id", &["poid", "purchaseorder", "siparisno", "satinalmasiparisno"]),
    ("item_count", &["itemcount", "kalemsayisi", "satirsayisi"]),
    ("total_expected", &["totalexpected", "beklentoplam", "siparistoplami"]),
];

const DELIVERY_NOTE_SYNONYMS: &[(&str, &[&str])] = &[
    ("dn_id", &["deliveryid", "irsaliyeno", "deliveryno", "dnid"]),
    ("delivered_item_count", &["delivereditemcount", "teslimkalemsayisi", "teslimsayi"]),
];

// ============================================================================
// TESTS
// ============================================================================
