use super::{ServiceError, ServiceResult, Services};
use crate::core::models::{Client, Product};
use crate::core::store::{CLIENTS, PRODUCTS};

/// Clients and products live only in the local store.
pub struct CatalogService {
    ctx: Services,
}

#[derive(Debug, Clone, Default)]
pub struct ClientDraft {
    pub name: Option<String>,
    pub contact: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ProductDraft {
    pub name: Option<String>,
    pub category: Option<String>,
    pub price: Option<String>,
    pub stock: Option<u32>,
}

fn checked_name(name: Option<&String>) -> ServiceResult<Option<String>> {
    match name {
        Some(n) if n.trim().is_empty() => Err(ServiceError::Invalid("Name cannot be empty".into())),
        Some(n) => Ok(Some(n.trim().to_string())),
        None => Ok(None),
    }
}

fn checked_price(price: Option<&String>) -> ServiceResult<Option<String>> {
    match price {
        Some(p) if p.trim().parse::<f64>().is_err() => Err(ServiceError::Invalid(format!(
            "Price '{}' is not a number",
            p
        ))),
        Some(p) => Ok(Some(p.trim().to_string())),
        None => Ok(None),
    }
}

impl ClientDraft {
    fn apply(&self, client: &mut Client) -> ServiceResult<()> {
        if let Some(name) = checked_name(self.name.as_ref())? {
            client.name = name;
        }
        if let Some(contact) = &self.contact {
            client.contact = contact.clone();
        }
        if let Some(email) = &self.email {
            client.email = email.clone();
        }
        if let Some(phone) = &self.phone {
            client.phone = phone.clone();
        }
        Ok(())
    }
}

impl ProductDraft {
    fn apply(&self, product: &mut Product) -> ServiceResult<()> {
        if let Some(name) = checked_name(self.name.as_ref())? {
            product.name = name;
        }
        if let Some(category) = &self.category {
            product.category = category.clone();
        }
        if let Some(price) = checked_price(self.price.as_ref())? {
            product.price = price;
        }
        if let Some(stock) = self.stock {
            product.stock = stock;
        }
        Ok(())
    }
}

impl CatalogService {
    pub(super) fn new(ctx: Services) -> Self {
        Self { ctx }
    }

    pub async fn list_clients(&self) -> ServiceResult<Vec<Client>> {
        Ok(self.ctx.store.get(CLIENTS).await?)
    }

    pub async fn add_client(&self, draft: &ClientDraft) -> ServiceResult<Client> {
        if draft.name.is_none() {
            return Err(ServiceError::Invalid("Client name is required".into()));
        }
        let existing = self.list_clients().await?;
        let mut client = Client {
            id: existing.iter().map(|c| c.id).max().unwrap_or(0) + 1,
            name: String::new(),
            contact: String::new(),
            email: String::new(),
            phone: String::new(),
        };
        draft.apply(&mut client)?;
        self.ctx.store.save(CLIENTS, &client).await?;
        Ok(client)
    }

    pub async fn update_client(&self, id: u64, draft: &ClientDraft) -> ServiceResult<Client> {
        let mut client: Client = self
            .ctx
            .store
            .find(CLIENTS, &id.to_string())
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Client {}", id)))?;
        draft.apply(&mut client)?;
        self.ctx.store.save(CLIENTS, &client).await?;
        Ok(client)
    }

    pub async fn delete_client(&self, id: u64) -> ServiceResult<()> {
        if !self.ctx.store.delete(CLIENTS, &id.to_string()).await? {
            return Err(ServiceError::NotFound(format!("Client {}", id)));
        }
        Ok(())
    }

    pub async fn list_products(&self) -> ServiceResult<Vec<Product>> {
        Ok(self.ctx.store.get(PRODUCTS).await?)
    }

    pub async fn add_product(&self, draft: &ProductDraft) -> ServiceResult<Product> {
        if draft.name.is_none() {
            return Err(ServiceError::Invalid("Product name is required".into()));
        }
        let existing = self.list_products().await?;
        let mut product = Product {
            id: existing.iter().map(|p| p.id).max().unwrap_or(0) + 1,
            name: String::new(),
            category: String::new(),
            price: "0".to_string(),
            stock: 0,
        };
        draft.apply(&mut product)?;
        self.ctx.store.save(PRODUCTS, &product).await?;
        Ok(product)
    }

    pub async fn update_product(&self, id: u64, draft: &ProductDraft) -> ServiceResult<Product> {
        let mut product: Product = self
            .ctx
            .store
            .find(PRODUCTS, &id.to_string())
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {}", id)))?;
        draft.apply(&mut product)?;
        self.ctx.store.save(PRODUCTS, &product).await?;
        Ok(product)
    }

    pub async fn delete_product(&self, id: u64) -> ServiceResult<()> {
        if !self.ctx.store.delete(PRODUCTS, &id.to_string()).await? {
            return Err(ServiceError::NotFound(format!("Product {}", id)));
        }
        Ok(())
    }
}
