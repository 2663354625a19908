use std::cmp::Ordering;

use crate::core::models::{Agent, Client, Execution, Invoice, Product};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn toggled(self) -> Self {
        match self {
            SortDirection::Asc => SortDirection::Desc,
            SortDirection::Desc => SortDirection::Asc,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SortKey {
    Text(String),
    Number(f64),
}

impl SortKey {
    fn compare(&self, other: &SortKey) -> Ordering {
        match (self, other) {
            (SortKey::Number(a), SortKey::Number(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (SortKey::Text(a), SortKey::Text(b)) => a.cmp(b),
            (SortKey::Number(_), SortKey::Text(_)) => Ordering::Less,
            (SortKey::Text(_), SortKey::Number(_)) => Ordering::Greater,
        }
    }
}

/// An entity that can be searched and sorted in a list view.
pub trait Listable {
    /// Text fields matched by the search box.
    fn search_fields(&self) -> Vec<&str>;

    /// Value of a sortable field, `None` when the field is unknown or unset.
    fn sort_key(&self, field: &str) -> Option<SortKey>;
}

fn text(value: &str) -> Option<SortKey> {
    Some(SortKey::Text(value.to_string()))
}

fn opt_text(value: &Option<String>) -> Option<SortKey> {
    value.as_deref().and_then(text)
}

impl Listable for Agent {
    fn search_fields(&self) -> Vec<&str> {
        vec![self.name.as_str(), self.role.as_str()]
    }

    fn sort_key(&self, field: &str) -> Option<SortKey> {
        match field {
            "name" => text(&self.name),
            "role" => text(&self.role),
            "createdAt" => opt_text(&self.created_at),
            "id" => text(&self.id),
            _ => None,
        }
    }
}

impl Listable for Client {
    fn search_fields(&self) -> Vec<&str> {
        vec![
            self.name.as_str(),
            self.contact.as_str(),
            self.email.as_str(),
            self.phone.as_str(),
        ]
    }

    fn sort_key(&self, field: &str) -> Option<SortKey> {
        match field {
            "id" => Some(SortKey::Number(self.id as f64)),
            "name" => text(&self.name),
            "contact" => text(&self.contact),
            "email" => text(&self.email),
            "phone" => text(&self.phone),
            _ => None,
        }
    }
}

impl Listable for Product {
    fn search_fields(&self) -> Vec<&str> {
        vec![self.name.as_str(), self.category.as_str()]
    }

    fn sort_key(&self, field: &str) -> Option<SortKey> {
        match field {
            "id" => Some(SortKey::Number(self.id as f64)),
            "name" => text(&self.name),
            "category" => text(&self.category),
            "price" => Some(match self.price.trim().parse::<f64>() {
                Ok(n) => SortKey::Number(n),
                Err(_) => SortKey::Text(self.price.clone()),
            }),
            "stock" => Some(SortKey::Number(self.stock as f64)),
            _ => None,
        }
    }
}

impl Listable for Invoice {
    fn search_fields(&self) -> Vec<&str> {
        let mut fields = vec![self.invoice_number.as_str(), self.client_name.as_str()];
        if let Some(d) = &self.description {
            fields.push(d.as_str());
        }
        fields
    }

    fn sort_key(&self, field: &str) -> Option<SortKey> {
        match field {
            "invoiceNumber" => text(&self.invoice_number),
            "clientName" => text(&self.client_name),
            "amount" => Some(SortKey::Number(self.amount)),
            "dueDate" => opt_text(&self.due_date),
            "issueDate" => opt_text(&self.issue_date),
            "status" => text(self.status.as_str()),
            _ => None,
        }
    }
}

impl Listable for Execution {
    fn search_fields(&self) -> Vec<&str> {
        let mut fields = vec![self.id.as_str(), self.agent_id.as_str(), self.status.as_str()];
        fields.extend(self.files.iter().map(String::as_str));
        fields
    }

    fn sort_key(&self, field: &str) -> Option<SortKey> {
        match field {
            "startTime" => opt_text(&self.start_time),
            "endTime" => opt_text(&self.end_time),
            "status" => text(self.status.as_str()),
            "agentId" => text(&self.agent_id),
            _ => None,
        }
    }
}

/// Transient list state: search term plus sort field and direction.
#[derive(Debug, Clone, PartialEq)]
pub struct ListQuery {
    pub search: Option<String>,
    pub sort_field: String,
    pub direction: SortDirection,
}

impl ListQuery {
    pub fn new(sort_field: &str, direction: SortDirection) -> Self {
        Self {
            search: None,
            sort_field: sort_field.to_string(),
            direction,
        }
    }

    pub fn with_search(mut self, search: Option<String>) -> Self {
        self.search = search.filter(|s| !s.trim().is_empty());
        self
    }

    /// Selecting the active field flips its direction; a new field starts ascending.
    pub fn toggle_sort(&mut self, field: &str) {
        if self.sort_field == field {
            self.direction = self.direction.toggled();
        } else {
            self.sort_field = field.to_string();
            self.direction = SortDirection::Asc;
        }
    }

    pub fn matches<T: Listable>(&self, item: &T) -> bool {
        let Some(term) = &self.search else {
            return true;
        };
        let term = term.to_lowercase();
        item.search_fields()
            .iter()
            .any(|f| f.to_lowercase().contains(&term))
    }

    pub fn apply<T: Listable>(&self, items: Vec<T>) -> Vec<T> {
        let mut out: Vec<T> = items.into_iter().filter(|i| self.matches(i)).collect();
        out.sort_by(|a, b| {
            let ord = match (a.sort_key(&self.sort_field), b.sort_key(&self.sort_field)) {
                (Some(x), Some(y)) => x.compare(&y),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            match self.direction {
                SortDirection::Asc => ord,
                SortDirection::Desc => ord.reverse(),
            }
        });
        out
    }
}
