use rust_decimal::Decimal;

/// Closed set of inline-button request kinds. Callback data is a compact
/// `|`-separated wire form; anything that fails to parse is a typed
/// `Unknown` reject, never a panic.
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackAction {
    Start,
    Shop,
    City { city_idx: usize },
    District { city_idx: usize, district_idx: usize },
    ProductType { city_idx: usize, district_idx: usize, type_idx: usize },
    AddToBasket {
        city_idx: usize,
        district_idx: usize,
        type_idx: usize,
        size: String,
        price: Decimal,
    },
    ViewBasket,
    RemoveFromBasket { product_id: i64 },
    ClearBasket,
    ApplyDiscountStart,
    RemoveDiscount,
    ConfirmPay,
    PayWithBalance,
    PayWithCrypto { currency: String },
    Refill,
    RefillCurrency { currency: String },
    Profile,
    PriceList,
    PriceListCity { city_idx: usize },
    Language,
    SetLanguage { lang: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownAction(pub String);

impl CallbackAction {
    pub fn encode(&self) -> String {
        match self {
            Self::Start => "start".to_string(),
            Self::Shop => "shop".to_string(),
            Self::City { city_idx } => format!("city|{}", city_idx),
            Self::District { city_idx, district_idx } => {
                format!("dist|{}|{}", city_idx, district_idx)
            }
            Self::ProductType { city_idx, district_idx, type_idx } => {
                format!("type|{}|{}|{}", city_idx, district_idx, type_idx)
            }
            Self::AddToBasket { city_idx, district_idx, type_idx, size, price } => {
                format!("add|{}|{}|{}|{}|{}", city_idx, district_idx, type_idx, size, price)
            }
            Self::ViewBasket => "basket".to_string(),
            Self::RemoveFromBasket { product_id } => format!("rm|{}", product_id),
            Self::ClearBasket => "clear".to_string(),
            Self::ApplyDiscountStart => "code".to_string(),
            Self::RemoveDiscount => "nocode".to_string(),
            Self::ConfirmPay => "pay".to_string(),
            Self::PayWithBalance => "paybal".to_string(),
            Self::PayWithCrypto { currency } => format!("paycur|{}", currency),
            Self::Refill => "refill".to_string(),
            Self::RefillCurrency { currency } => format!("refillcur|{}", currency),
            Self::Profile => "profile".to_string(),
            Self::PriceList => "prices".to_string(),
            Self::PriceListCity { city_idx } => format!("pricecity|{}", city_idx),
            Self::Language => "lang".to_string(),
            Self::SetLanguage { lang } => format!("setlang|{}", lang),
        }
    }

    pub fn parse(data: &str) -> Result<Self, UnknownAction> {
        let mut parts = data.split('|');
        let head = parts.next().unwrap_or_default();
        let rest: Vec<&str> = parts.collect();

        let unknown = || UnknownAction(data.to_string());

        match (head, rest.as_slice()) {
            ("start", []) => Ok(Self::Start),
            ("shop", []) => Ok(Self::Shop),
            ("city", [c]) => Ok(Self::City {
                city_idx: c.parse().map_err(|_| unknown())?,
            }),
            ("dist", [c, d]) => Ok(Self::District {
                city_idx: c.parse().map_err(|_| unknown())?,
                district_idx: d.parse().map_err(|_| unknown())?,
            }),
            ("type", [c, d, t]) => Ok(Self::ProductType {
                city_idx: c.parse().map_err(|_| unknown())?,
                district_idx: d.parse().map_err(|_| unknown())?,
                type_idx: t.parse().map_err(|_| unknown())?,
            }),
            ("add", [c, d, t, size, price]) => Ok(Self::AddToBasket {
                city_idx: c.parse().map_err(|_| unknown())?,
                district_idx: d.parse().map_err(|_| unknown())?,
                type_idx: t.parse().map_err(|_| unknown())?,
                size: (*size).to_string(),
                price: price.parse().map_err(|_| unknown())?,
            }),
            ("basket", []) => Ok(Self::ViewBasket),
            ("rm", [id]) => Ok(Self::RemoveFromBasket {
                product_id: id.parse().map_err(|_| unknown())?,
            }),
            ("clear", []) => Ok(Self::ClearBasket),
            ("code", []) => Ok(Self::ApplyDiscountStart),
            ("nocode", []) => Ok(Self::RemoveDiscount),
            ("pay", []) => Ok(Self::ConfirmPay),
            ("paybal", []) => Ok(Self::PayWithBalance),
            ("paycur", [currency]) => Ok(Self::PayWithCrypto {
                currency: (*currency).to_string(),
            }),
            ("refill", []) => Ok(Self::Refill),
            ("refillcur", [currency]) => Ok(Self::RefillCurrency {
                currency: (*currency).to_string(),
            }),
            ("profile", []) => Ok(Self::Profile),
            ("prices", []) => Ok(Self::PriceList),
            ("pricecity", [c]) => Ok(Self::PriceListCity {
                city_idx: c.parse().map_err(|_| unknown())?,
            }),
            ("lang", []) => Ok(Self::Language),
            ("setlang", [lang]) => Ok(Self::SetLanguage {
                lang: (*lang).to_string(),
            }),
            _ => Err(unknown()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_action() {
        let actions = vec![
            CallbackAction::Start,
            CallbackAction::Shop,
            CallbackAction::City { city_idx: 3 },
            CallbackAction::District { city_idx: 0, district_idx: 2 },
            CallbackAction::ProductType { city_idx: 1, district_idx: 0, type_idx: 4 },
            CallbackAction::AddToBasket {
                city_idx: 0,
                district_idx: 1,
                type_idx: 2,
                size: "2g".to_string(),
                price: "10.00".parse().unwrap(),
            },
            CallbackAction::ViewBasket,
            CallbackAction::RemoveFromBasket { product_id: 42 },
            CallbackAction::ClearBasket,
            CallbackAction::ApplyDiscountStart,
            CallbackAction::RemoveDiscount,
            CallbackAction::ConfirmPay,
            CallbackAction::PayWithBalance,
            CallbackAction::PayWithCrypto { currency: "sol".to_string() },
            CallbackAction::Refill,
            CallbackAction::RefillCurrency { currency: "btc".to_string() },
            CallbackAction::Profile,
            CallbackAction::PriceList,
            CallbackAction::PriceListCity { city_idx: 0 },
            CallbackAction::Language,
            CallbackAction::SetLanguage { lang: "en".to_string() },
        ];

        for action in actions {
            let encoded = action.encode();
            assert_eq!(CallbackAction::parse(&encoded), Ok(action), "{}", encoded);
        }
    }

    #[test]
    fn junk_is_a_typed_reject() {
        for junk in ["", "bogus", "city|notanumber", "add|1|2", "rm|x", "city|1|extra"] {
            assert!(CallbackAction::parse(junk).is_err(), "{}", junk);
        }
    }
}
