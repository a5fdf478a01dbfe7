//! Document classes and classification rules

use serde::{Deserialize, Serialize};

/// Document class driving the chunking-strategy choice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentClass {
    ExpenseDocument,
    FinancialStatement,
    Contract,
    Report,
    GeneralDocument,
}

impl DocumentClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentClass::ExpenseDocument => "expense_document",
            DocumentClass::FinancialStatement => "financial_statement",
            DocumentClass::Contract => "contract",
            DocumentClass::Report => "report",
            DocumentClass::GeneralDocument => "general_document",
        }
    }
}

impl std::fmt::Display for DocumentClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DocumentClass {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "expense_document" => Ok(DocumentClass::ExpenseDocument),
            "financial_statement" => Ok(DocumentClass::FinancialStatement),
            "contract" => Ok(DocumentClass::Contract),
            "report" => Ok(DocumentClass::Report),
            "general_document" => Ok(DocumentClass::GeneralDocument),
            _ => Err(()),
        }
    }
}

/// Classify a document from its filename and extracted text.
///
/// Filename hints win over content hints; anything unrecognised is a
/// general document.
pub fn classify_document(filename: Option<&str>, text: &str) -> DocumentClass {
    if let Some(name) = filename {
        let name = name.to_lowercase();

        if ["receipt", "invoice", "bill"].iter().any(|w| name.contains(w)) {
            return DocumentClass::ExpenseDocument;
        }
        if ["statement", "bank"].iter().any(|w| name.contains(w)) {
            return DocumentClass::FinancialStatement;
        }
        if ["contract", "agreement"].iter().any(|w| name.contains(w)) {
            return DocumentClass::Contract;
        }
        if ["report", "summary"].iter().any(|w| name.contains(w)) {
            return DocumentClass::Report;
        }
    }

    let text = text.to_lowercase();
    if ["total:", "amount:", "$", "payment", "transaction"]
        .iter()
        .any(|w| text.contains(w))
    {
        return DocumentClass::ExpenseDocument;
    }

    DocumentClass::GeneralDocument
}
