use crate::{
    api::AppState,
    bot::{
        callbacks::CallbackAction,
        outbound,
        state::FlowState,
    },
    constants::{MIN_DEPOSIT_EUR, SETTING_WELCOME_MESSAGE, SUPPORTED_CURRENCIES},
    error::AppError,
    models::{BasketItem, ProductSelector},
    services::pricing::BasketScope,
    utils::format_eur,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::{
    InlineKeyboardButton, InlineKeyboardMarkup, MessageId, ReplyMarkup, Update, UpdateKind,
};

const DEFAULT_WELCOME: &str = "Welcome to the shop! Browse the catalog, reserve what you want \
and pay with crypto. Reserved items are held for a limited time.";
const BANNED_NOTICE: &str = "Your account is restricted. Contact support if you believe this \
is a mistake.";
const LANGUAGES: [(&str, &str); 3] = [("en", "English"), ("de", "Deutsch"), ("lt", "Lietuvių")];

/// Entry point for one gateway update envelope, already routed to the owning
/// transport by the sink.
pub async fn handle_update(state: AppState, bot: Arc<Bot>, bot_id: String, update: Update) {
    let result = match update.kind {
        UpdateKind::Message(message) => handle_message(&state, &bot, &bot_id, message).await,
        UpdateKind::CallbackQuery(query) => handle_callback(&state, &bot, &bot_id, query).await,
        _ => Ok(()),
    };

    if let Err(err) = result {
        tracing::error!("Update handling error (bot {}): {}", bot_id, err);
    }
}

async fn handle_message(
    state: &AppState,
    bot: &Bot,
    bot_id: &str,
    message: teloxide::types::Message,
) -> crate::error::Result<()> {
    let Some(from) = message.from.clone() else {
        return Ok(());
    };
    let user_id = from.id.0 as i64;
    let chat_id = message.chat.id.0;
    let Some(text) = message.text().map(str::to_string) else {
        return Ok(());
    };

    state.db.touch_user(user_id, from.username.as_deref()).await?;
    if is_banned(state, user_id).await? {
        outbound::send_text(bot, chat_id, BANNED_NOTICE).await;
        return Ok(());
    }

    if text.starts_with("/start") {
        state.sessions.reset(user_id).await;
        show_start_menu(state, bot, chat_id, None).await;
        return Ok(());
    }
    if text.starts_with("/admin") {
        let reply = if state.config.is_admin(user_id) {
            "Admin operations run through the management API; see the operator handbook."
        } else {
            BANNED_NOTICE
        };
        outbound::send_text(bot, chat_id, reply).await;
        return Ok(());
    }

    // Free text only means something when a flow is waiting for it.
    let session = state.sessions.get(user_id).await;
    match session.state {
        FlowState::AwaitingDiscountCode => {
            handle_discount_code_input(state, bot, bot_id, user_id, chat_id, &text).await
        }
        FlowState::AwaitingRefillAmount => {
            handle_refill_amount_input(state, bot, user_id, chat_id, &text).await
        }
        FlowState::Idle => Ok(()),
    }
}

async fn handle_callback(
    state: &AppState,
    bot: &Bot,
    bot_id: &str,
    query: teloxide::types::CallbackQuery,
) -> crate::error::Result<()> {
    let user_id = query.from.id.0 as i64;
    let chat_id = query
        .message
        .as_ref()
        .map(|m| m.chat().id.0)
        .unwrap_or(user_id);
    let message_id = query.message.as_ref().map(|m| m.id());

    // Stale-query answers are benign; ignore the result.
    let _ = bot.answer_callback_query(query.id.clone()).await;

    state
        .db
        .touch_user(user_id, query.from.username.as_deref())
        .await?;
    if is_banned(state, user_id).await? {
        outbound::send_text(bot, chat_id, BANNED_NOTICE).await;
        return Ok(());
    }

    let Some(data) = query.data.as_deref() else {
        return Ok(());
    };
    let action = match CallbackAction::parse(data) {
        Ok(action) => action,
        Err(unknown) => {
            tracing::warn!("Unknown callback action from user {}: {}", user_id, unknown.0);
            outbound::send_text(bot, chat_id, "Unknown action. Use /start to refresh the menu.")
                .await;
            return Ok(());
        }
    };

    dispatch_action(state, bot, bot_id, user_id, chat_id, message_id, action).await
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_action(
    state: &AppState,
    bot: &Bot,
    bot_id: &str,
    user_id: i64,
    chat_id: i64,
    message_id: Option<MessageId>,
    action: CallbackAction,
) -> crate::error::Result<()> {
    match action {
        CallbackAction::Start => {
            state.sessions.reset(user_id).await;
            show_start_menu(state, bot, chat_id, message_id).await;
        }
        CallbackAction::Shop => show_cities(state, bot, chat_id, message_id).await,
        CallbackAction::City { city_idx } => {
            show_districts(state, bot, chat_id, message_id, city_idx).await
        }
        CallbackAction::District { city_idx, district_idx } => {
            show_types(state, bot, chat_id, message_id, city_idx, district_idx).await
        }
        CallbackAction::ProductType { city_idx, district_idx, type_idx } => {
            show_variants(state, bot, chat_id, message_id, city_idx, district_idx, type_idx).await
        }
        CallbackAction::AddToBasket { city_idx, district_idx, type_idx, size, price } => {
            add_to_basket(
                state, bot, user_id, chat_id, message_id, city_idx, district_idx, type_idx, size,
                price,
            )
            .await?
        }
        CallbackAction::ViewBasket => show_basket(state, bot, user_id, chat_id, message_id).await?,
        CallbackAction::RemoveFromBasket { product_id } => {
            state.reservations.remove_from_basket(user_id, product_id).await?;
            show_basket(state, bot, user_id, chat_id, message_id).await?
        }
        CallbackAction::ClearBasket => {
            state.reservations.clear_basket(user_id).await?;
            state.sessions.set_applied_code(user_id, None).await;
            outbound::edit_or_send(bot, chat_id, message_id, "Basket cleared.", None).await;
        }
        CallbackAction::ApplyDiscountStart => {
            state
                .sessions
                .set_state(user_id, FlowState::AwaitingDiscountCode)
                .await;
            outbound::edit_or_send(bot, chat_id, message_id, "Send your discount code:", None)
                .await;
        }
        CallbackAction::RemoveDiscount => {
            state.sessions.set_applied_code(user_id, None).await;
            show_basket(state, bot, user_id, chat_id, message_id).await?
        }
        CallbackAction::ConfirmPay => {
            show_payment_options(state, bot, user_id, chat_id, message_id).await?
        }
        CallbackAction::PayWithBalance => {
            pay_with_balance(state, bot, bot_id, user_id, chat_id, message_id).await?
        }
        CallbackAction::PayWithCrypto { currency } => {
            pay_with_crypto(state, bot, bot_id, user_id, chat_id, message_id, &currency).await?
        }
        CallbackAction::Refill => {
            state
                .sessions
                .set_state(user_id, FlowState::AwaitingRefillAmount)
                .await;
            outbound::edit_or_send(
                bot,
                chat_id,
                message_id,
                &format!("How much would you like to top up? (minimum {} EUR)", MIN_DEPOSIT_EUR),
                None,
            )
            .await;
        }
        CallbackAction::RefillCurrency { currency } => {
            refill_with_currency(state, bot, bot_id, user_id, chat_id, message_id, &currency)
                .await?
        }
        CallbackAction::Profile => show_profile(state, bot, user_id, chat_id, message_id).await?,
        CallbackAction::PriceList => show_price_list_cities(state, bot, chat_id, message_id).await,
        CallbackAction::PriceListCity { city_idx } => {
            show_price_list(state, bot, chat_id, message_id, city_idx).await?
        }
        CallbackAction::Language => show_language_menu(bot, chat_id, message_id).await,
        CallbackAction::SetLanguage { lang } => {
            if LANGUAGES.iter().any(|(tag, _)| *tag == lang) {
                state.db.set_language(user_id, &lang).await?;
            }
            show_start_menu(state, bot, chat_id, message_id).await;
        }
    }
    Ok(())
}

// -------------------- menus --------------------

async fn show_start_menu(state: &AppState, bot: &Bot, chat_id: i64, message_id: Option<MessageId>) {
    let welcome = state
        .db
        .get_setting(SETTING_WELCOME_MESSAGE)
        .await
        .ok()
        .flatten()
        .unwrap_or_else(|| DEFAULT_WELCOME.to_string());

    let keyboard = InlineKeyboardMarkup::new(vec![
        vec![
            button("🛍 Shop", CallbackAction::Shop),
            button("🛒 Basket", CallbackAction::ViewBasket),
        ],
        vec![
            button("👤 Profile", CallbackAction::Profile),
            button("💳 Top Up", CallbackAction::Refill),
        ],
        vec![
            button("💶 Price List", CallbackAction::PriceList),
            button("🌐 Language", CallbackAction::Language),
        ],
    ]);

    let text = format!(
        "{}\n\nSupport: @{}",
        welcome, state.config.support_username
    );
    outbound::edit_or_send(
        bot,
        chat_id,
        message_id,
        &text,
        Some(ReplyMarkup::InlineKeyboard(keyboard)),
    )
    .await;
}

async fn show_cities(state: &AppState, bot: &Bot, chat_id: i64, message_id: Option<MessageId>) {
    let snapshot = state.catalog.snapshot().await;
    if snapshot.cities.is_empty() {
        outbound::edit_or_send(bot, chat_id, message_id, "The shop is currently empty.", None)
            .await;
        return;
    }

    let mut rows: Vec<Vec<InlineKeyboardButton>> = snapshot
        .cities
        .iter()
        .enumerate()
        .map(|(city_idx, city)| vec![button(&city.name, CallbackAction::City { city_idx })])
        .collect();
    rows.push(vec![button("⬅️ Home", CallbackAction::Start)]);

    outbound::edit_or_send(
        bot,
        chat_id,
        message_id,
        "Choose a city:",
        Some(ReplyMarkup::InlineKeyboard(InlineKeyboardMarkup::new(rows))),
    )
    .await;
}

async fn show_districts(
    state: &AppState,
    bot: &Bot,
    chat_id: i64,
    message_id: Option<MessageId>,
    city_idx: usize,
) {
    let snapshot = state.catalog.snapshot().await;
    let Some(city) = snapshot.cities.get(city_idx) else {
        show_cities(state, bot, chat_id, message_id).await;
        return;
    };

    let mut rows: Vec<Vec<InlineKeyboardButton>> = city
        .districts
        .iter()
        .enumerate()
        .map(|(district_idx, district)| {
            vec![button(
                &district.name,
                CallbackAction::District { city_idx, district_idx },
            )]
        })
        .collect();
    rows.push(vec![button("⬅️ Back", CallbackAction::Shop)]);

    outbound::edit_or_send(
        bot,
        chat_id,
        message_id,
        &format!("{} — choose a district:", city.name),
        Some(ReplyMarkup::InlineKeyboard(InlineKeyboardMarkup::new(rows))),
    )
    .await;
}

async fn show_types(
    state: &AppState,
    bot: &Bot,
    chat_id: i64,
    message_id: Option<MessageId>,
    city_idx: usize,
    district_idx: usize,
) {
    let snapshot = state.catalog.snapshot().await;
    let Some((city, district)) = snapshot
        .cities
        .get(city_idx)
        .and_then(|c| c.districts.get(district_idx).map(|d| (c, d)))
    else {
        show_cities(state, bot, chat_id, message_id).await;
        return;
    };

    let mut rows: Vec<Vec<InlineKeyboardButton>> = district
        .types
        .iter()
        .enumerate()
        .map(|(type_idx, product_type)| {
            vec![button(
                product_type,
                CallbackAction::ProductType { city_idx, district_idx, type_idx },
            )]
        })
        .collect();
    rows.push(vec![button("⬅️ Back", CallbackAction::City { city_idx })]);

    outbound::edit_or_send(
        bot,
        chat_id,
        message_id,
        &format!("{} / {} — choose a product:", city.name, district.name),
        Some(ReplyMarkup::InlineKeyboard(InlineKeyboardMarkup::new(rows))),
    )
    .await;
}

async fn show_variants(
    state: &AppState,
    bot: &Bot,
    chat_id: i64,
    message_id: Option<MessageId>,
    city_idx: usize,
    district_idx: usize,
    type_idx: usize,
) {
    let Some((city, district, product_type)) = state
        .catalog
        .product_type(city_idx, district_idx, type_idx)
        .await
    else {
        show_cities(state, bot, chat_id, message_id).await;
        return;
    };

    let variants = match state.db.list_variants(&city, &district, &product_type).await {
        Ok(variants) => variants,
        Err(err) => {
            tracing::error!("Variant listing failed: {}", err);
            Vec::new()
        }
    };

    if variants.is_empty() {
        outbound::edit_or_send(
            bot,
            chat_id,
            message_id,
            "Out of stock here right now. Check back soon!",
            Some(ReplyMarkup::InlineKeyboard(InlineKeyboardMarkup::new(vec![vec![button(
                "⬅️ Back",
                CallbackAction::District { city_idx, district_idx },
            )]]))),
        )
        .await;
        return;
    }

    let mut rows: Vec<Vec<InlineKeyboardButton>> = variants
        .iter()
        .map(|variant| {
            vec![button(
                &format!(
                    "{} — {} EUR ({} left)",
                    variant.size,
                    format_eur(variant.price),
                    variant.in_stock
                ),
                CallbackAction::AddToBasket {
                    city_idx,
                    district_idx,
                    type_idx,
                    size: variant.size.clone(),
                    price: variant.price,
                },
            )]
        })
        .collect();
    rows.push(vec![button(
        "⬅️ Back",
        CallbackAction::District { city_idx, district_idx },
    )]);

    outbound::edit_or_send(
        bot,
        chat_id,
        message_id,
        &format!("{} in {} / {} — pick a size:", product_type, city, district),
        Some(ReplyMarkup::InlineKeyboard(InlineKeyboardMarkup::new(rows))),
    )
    .await;
}

// -------------------- basket flow --------------------

#[allow(clippy::too_many_arguments)]
async fn add_to_basket(
    state: &AppState,
    bot: &Bot,
    user_id: i64,
    chat_id: i64,
    message_id: Option<MessageId>,
    city_idx: usize,
    district_idx: usize,
    type_idx: usize,
    size: String,
    price: Decimal,
) -> crate::error::Result<()> {
    let Some((city, district, product_type)) = state
        .catalog
        .product_type(city_idx, district_idx, type_idx)
        .await
    else {
        show_cities(state, bot, chat_id, message_id).await;
        return Ok(());
    };

    let selector = ProductSelector {
        city,
        district,
        product_type,
        size,
        price,
    };

    match state.reservations.add_to_basket(user_id, &selector).await {
        Ok(_) => {
            let timeout = state.config.basket_timeout_minutes;
            let quote_text = basket_summary(state, user_id).await?;
            let keyboard = InlineKeyboardMarkup::new(vec![
                vec![
                    button("💳 Pay Now", CallbackAction::ConfirmPay),
                    button("🛒 View Basket", CallbackAction::ViewBasket),
                ],
                vec![
                    button("🏷 Discount Code", CallbackAction::ApplyDiscountStart),
                    button("➕ Shop More", CallbackAction::District { city_idx, district_idx }),
                ],
                vec![button("⬅️ Home", CallbackAction::Start)],
            ]);
            outbound::edit_or_send(
                bot,
                chat_id,
                message_id,
                &format!(
                    "✅ Item reserved for {} minutes!\n\n{}",
                    timeout, quote_text
                ),
                Some(ReplyMarkup::InlineKeyboard(keyboard)),
            )
            .await;
        }
        Err(AppError::OutOfStock) => {
            let keyboard = InlineKeyboardMarkup::new(vec![vec![
                button(
                    "⬅️ Back",
                    CallbackAction::ProductType { city_idx, district_idx, type_idx },
                ),
                button("🏠 Home", CallbackAction::Start),
            ]]);
            outbound::edit_or_send(
                bot,
                chat_id,
                message_id,
                "❌ Out of stock! The last one was just taken or reserved.",
                Some(ReplyMarkup::InlineKeyboard(keyboard)),
            )
            .await;
        }
        Err(err) => return Err(err),
    }
    Ok(())
}

async fn show_basket(
    state: &AppState,
    bot: &Bot,
    user_id: i64,
    chat_id: i64,
    message_id: Option<MessageId>,
) -> crate::error::Result<()> {
    let items = state.reservations.current_basket(user_id).await?;
    if items.is_empty() {
        outbound::edit_or_send(
            bot,
            chat_id,
            message_id,
            "Your basket is empty.",
            Some(ReplyMarkup::InlineKeyboard(InlineKeyboardMarkup::new(vec![vec![button(
                "🛍 Shop",
                CallbackAction::Shop,
            )]]))),
        )
        .await;
        return Ok(());
    }

    let summary = basket_summary(state, user_id).await?;

    let mut rows: Vec<Vec<InlineKeyboardButton>> = items
        .iter()
        .map(|item| {
            vec![button(
                &format!(
                    "❌ Remove {} ({} EUR)",
                    item.product_type_snapshot,
                    format_eur(item.price_snapshot)
                ),
                CallbackAction::RemoveFromBasket { product_id: item.product_id },
            )]
        })
        .collect();
    rows.push(vec![
        button("💳 Pay Now", CallbackAction::ConfirmPay),
        button("🗑 Clear", CallbackAction::ClearBasket),
    ]);
    rows.push(vec![
        button("🏷 Discount Code", CallbackAction::ApplyDiscountStart),
        button("⬅️ Home", CallbackAction::Start),
    ]);

    outbound::edit_or_send(
        bot,
        chat_id,
        message_id,
        &summary,
        Some(ReplyMarkup::InlineKeyboard(InlineKeyboardMarkup::new(rows))),
    )
    .await;
    Ok(())
}

/// Quoted totals for the current basket, re-validating any applied code and
/// detaching it silently when it no longer fits.
async fn basket_summary(state: &AppState, user_id: i64) -> crate::error::Result<String> {
    let items = state.reservations.current_basket(user_id).await?;
    let session = state.sessions.get(user_id).await;
    let scope = scope_for_items(state, &items).await?;

    let quote = state
        .resolver
        .quote(user_id, &items, session.applied_code.as_deref(), &scope)
        .await?;

    if session.applied_code.is_some() && quote.applied_code.is_none() {
        state.sessions.set_applied_code(user_id, None).await;
    }

    let mut text = format!("🛒 Basket ({} item(s))\n\n", items.len());
    for item in &items {
        text.push_str(&format!(
            "• {} — {} EUR\n",
            item.product_type_snapshot,
            format_eur(item.price_snapshot)
        ));
    }
    text.push_str(&format!("\nSubtotal: {} EUR\n", format_eur(quote.subtotal)));
    if quote.reseller_discount > Decimal::ZERO {
        text.push_str(&format!(
            "Reseller discount: -{} EUR\n",
            format_eur(quote.reseller_discount)
        ));
    }
    if let Some(code) = &quote.applied_code {
        text.push_str(&format!(
            "Code {}: -{} EUR\n",
            code,
            format_eur(quote.code_discount)
        ));
    }
    text.push_str(&format!("\n💳 Total to pay: {} EUR", format_eur(quote.final_total)));
    Ok(text)
}

async fn scope_for_items(
    state: &AppState,
    items: &[BasketItem],
) -> crate::error::Result<BasketScope> {
    let mut scope = BasketScope::default();
    for item in items {
        if let Some(product) = state.db.get_product(item.product_id).await? {
            scope.cities.push(product.city);
            scope.types.push(product.product_type);
            scope.sizes.push(product.size);
        }
    }
    Ok(scope)
}

// -------------------- discount & payment flow --------------------

async fn handle_discount_code_input(
    state: &AppState,
    bot: &Bot,
    _bot_id: &str,
    user_id: i64,
    chat_id: i64,
    text: &str,
) -> crate::error::Result<()> {
    state.sessions.reset(user_id).await;

    let items = state.reservations.current_basket(user_id).await?;
    if items.is_empty() {
        outbound::send_text(bot, chat_id, "Your basket is empty; add an item first.").await;
        return Ok(());
    }

    let scope = scope_for_items(state, &items).await?;
    let quote = state.resolver.quote(user_id, &items, None, &scope).await?;

    match state
        .resolver
        .validate_and_consume(text, quote.after_reseller, user_id, &scope)
        .await
    {
        Ok(outcome) => {
            state
                .sessions
                .set_applied_code(user_id, Some(outcome.code.clone()))
                .await;
            outbound::send_text(
                bot,
                chat_id,
                &format!(
                    "Code {} applied: -{} EUR. New total: {} EUR.",
                    outcome.code,
                    format_eur(outcome.discount_amount),
                    format_eur(outcome.final_total)
                ),
            )
            .await;
        }
        Err(AppError::DiscountRejected(reason)) => {
            outbound::send_text(bot, chat_id, &format!("❌ {}", reason)).await;
        }
        Err(err) => return Err(err),
    }
    Ok(())
}

async fn show_payment_options(
    state: &AppState,
    bot: &Bot,
    user_id: i64,
    chat_id: i64,
    message_id: Option<MessageId>,
) -> crate::error::Result<()> {
    let items = state.reservations.current_basket(user_id).await?;
    if items.is_empty() {
        outbound::edit_or_send(bot, chat_id, message_id, "Your basket is empty.", None).await;
        return Ok(());
    }

    let summary = basket_summary(state, user_id).await?;
    let balance = state
        .db
        .get_user(user_id)
        .await?
        .map(|u| u.balance)
        .unwrap_or_default();

    let mut rows: Vec<Vec<InlineKeyboardButton>> = vec![vec![button(
        &format!("💰 Pay from balance ({} EUR)", format_eur(balance)),
        CallbackAction::PayWithBalance,
    )]];
    rows.push(
        SUPPORTED_CURRENCIES
            .iter()
            .map(|currency| {
                button(
                    &currency.to_uppercase(),
                    CallbackAction::PayWithCrypto { currency: currency.to_string() },
                )
            })
            .collect(),
    );
    rows.push(vec![button("⬅️ Back", CallbackAction::ViewBasket)]);

    outbound::edit_or_send(
        bot,
        chat_id,
        message_id,
        &format!("{}\n\nChoose a payment method:", summary),
        Some(ReplyMarkup::InlineKeyboard(InlineKeyboardMarkup::new(rows))),
    )
    .await;
    Ok(())
}

async fn pay_with_balance(
    state: &AppState,
    bot: &Bot,
    bot_id: &str,
    user_id: i64,
    chat_id: i64,
    message_id: Option<MessageId>,
) -> crate::error::Result<()> {
    let session = state.sessions.get(user_id).await;
    match state
        .finalizer
        .purchase_with_balance(user_id, bot_id, session.applied_code.as_deref())
        .await
    {
        Ok(delivered) => {
            state.sessions.set_applied_code(user_id, None).await;
            outbound::edit_or_send(
                bot,
                chat_id,
                message_id,
                &format!("✅ Purchase complete — {} item(s) delivered below.", delivered.len()),
                None,
            )
            .await;
        }
        Err(AppError::BadRequest(reason)) => {
            outbound::edit_or_send(bot, chat_id, message_id, &format!("❌ {}", reason), None).await;
        }
        Err(err) => return Err(err),
    }
    Ok(())
}

async fn pay_with_crypto(
    state: &AppState,
    bot: &Bot,
    bot_id: &str,
    user_id: i64,
    chat_id: i64,
    message_id: Option<MessageId>,
    currency: &str,
) -> crate::error::Result<()> {
    if !crate::constants::is_supported_currency(currency) {
        outbound::edit_or_send(bot, chat_id, message_id, "Unsupported currency.", None).await;
        return Ok(());
    }

    let session = state.sessions.get(user_id).await;
    match state
        .finalizer
        .create_purchase_intent(user_id, currency, bot_id, session.applied_code.as_deref())
        .await
    {
        Ok(intent) => {
            state.sessions.set_applied_code(user_id, None).await;
            let expiry = intent
                .expires_at
                .map(|at| format!("\nExpires: {}", at.format("%H:%M:%S UTC")))
                .unwrap_or_default();
            outbound::edit_or_send(
                bot,
                chat_id,
                message_id,
                &format!(
                    "Send exactly {} {} to:\n\n`{}`\n\nTotal: {} EUR{}\n\nYour items stay \
                     reserved while the payment is pending.",
                    intent.pay_amount,
                    intent.currency.to_uppercase(),
                    intent.pay_address,
                    format_eur(intent.target_eur),
                    expiry
                ),
                None,
            )
            .await;
        }
        Err(AppError::BadRequest(reason)) => {
            outbound::edit_or_send(bot, chat_id, message_id, &format!("❌ {}", reason), None).await;
        }
        Err(AppError::Gateway(reason)) => {
            tracing::error!("Payment intent failed for user {}: {}", user_id, reason);
            outbound::edit_or_send(
                bot,
                chat_id,
                message_id,
                "❌ The payment provider is unavailable right now. Please try again in a moment.",
                None,
            )
            .await;
        }
        Err(err) => return Err(err),
    }
    Ok(())
}

// -------------------- refill flow --------------------

async fn handle_refill_amount_input(
    state: &AppState,
    bot: &Bot,
    user_id: i64,
    chat_id: i64,
    text: &str,
) -> crate::error::Result<()> {
    let minimum: Decimal = MIN_DEPOSIT_EUR.parse().unwrap_or_default();
    let amount: Option<Decimal> = text.trim().replace(',', ".").parse().ok();

    let Some(amount) = amount.filter(|a| *a >= minimum) else {
        outbound::send_text(
            bot,
            chat_id,
            &format!("Please send a number of at least {} EUR.", MIN_DEPOSIT_EUR),
        )
        .await;
        return Ok(());
    };

    state.sessions.reset(user_id).await;
    state.sessions.set_refill_amount(user_id, Some(amount)).await;

    let rows = vec![
        SUPPORTED_CURRENCIES
            .iter()
            .map(|currency| {
                button(
                    &currency.to_uppercase(),
                    CallbackAction::RefillCurrency { currency: currency.to_string() },
                )
            })
            .collect::<Vec<_>>(),
        vec![button("⬅️ Home", CallbackAction::Start)],
    ];

    outbound::send_text_with_markup(
        bot,
        chat_id,
        &format!(
            "Top up {} EUR — choose the currency you will pay with:",
            format_eur(amount)
        ),
        ReplyMarkup::InlineKeyboard(InlineKeyboardMarkup::new(rows)),
    )
    .await;
    Ok(())
}

async fn refill_with_currency(
    state: &AppState,
    bot: &Bot,
    bot_id: &str,
    user_id: i64,
    chat_id: i64,
    message_id: Option<MessageId>,
    currency: &str,
) -> crate::error::Result<()> {
    let session = state.sessions.get(user_id).await;
    let Some(amount) = session.refill_amount else {
        outbound::edit_or_send(
            bot,
            chat_id,
            message_id,
            "Start a top-up first via the menu.",
            None,
        )
        .await;
        return Ok(());
    };

    match state
        .finalizer
        .create_refill_intent(user_id, amount, currency, bot_id)
        .await
    {
        Ok(intent) => {
            state.sessions.set_refill_amount(user_id, None).await;
            outbound::edit_or_send(
                bot,
                chat_id,
                message_id,
                &format!(
                    "Send exactly {} {} to:\n\n`{}`\n\nYour balance is credited once the \
                     payment confirms.",
                    intent.pay_amount,
                    intent.currency.to_uppercase(),
                    intent.pay_address
                ),
                None,
            )
            .await;
        }
        Err(AppError::BadRequest(reason)) => {
            outbound::edit_or_send(bot, chat_id, message_id, &format!("❌ {}", reason), None).await;
        }
        Err(AppError::Gateway(reason)) => {
            tracing::error!("Refill intent failed for user {}: {}", user_id, reason);
            outbound::edit_or_send(
                bot,
                chat_id,
                message_id,
                "❌ The payment provider is unavailable right now. Please try again in a moment.",
                None,
            )
            .await;
        }
        Err(err) => return Err(err),
    }
    Ok(())
}

// -------------------- profile & price list --------------------

async fn show_profile(
    state: &AppState,
    bot: &Bot,
    user_id: i64,
    chat_id: i64,
    message_id: Option<MessageId>,
) -> crate::error::Result<()> {
    let user = state.db.get_user(user_id).await?;
    let items = state.reservations.current_basket(user_id).await?;

    let (balance, purchases) = user
        .map(|u| (u.balance, u.total_purchases))
        .unwrap_or((Decimal::ZERO, 0));

    let keyboard = InlineKeyboardMarkup::new(vec![
        vec![
            button("💳 Top Up", CallbackAction::Refill),
            button("🛒 Basket", CallbackAction::ViewBasket),
        ],
        vec![button("⬅️ Home", CallbackAction::Start)],
    ]);

    outbound::edit_or_send(
        bot,
        chat_id,
        message_id,
        &format!(
            "👤 Your profile\n\nBalance: {} EUR\nTotal purchases: {}\nItems in basket: {}",
            format_eur(balance),
            purchases,
            items.len()
        ),
        Some(ReplyMarkup::InlineKeyboard(keyboard)),
    )
    .await;
    Ok(())
}

async fn show_price_list_cities(
    state: &AppState,
    bot: &Bot,
    chat_id: i64,
    message_id: Option<MessageId>,
) {
    let snapshot = state.catalog.snapshot().await;
    if snapshot.cities.is_empty() {
        outbound::edit_or_send(bot, chat_id, message_id, "The shop is currently empty.", None)
            .await;
        return;
    }

    let mut rows: Vec<Vec<InlineKeyboardButton>> = snapshot
        .cities
        .iter()
        .enumerate()
        .map(|(city_idx, city)| {
            vec![button(&city.name, CallbackAction::PriceListCity { city_idx })]
        })
        .collect();
    rows.push(vec![button("⬅️ Home", CallbackAction::Start)]);

    outbound::edit_or_send(
        bot,
        chat_id,
        message_id,
        "Price list — choose a city:",
        Some(ReplyMarkup::InlineKeyboard(InlineKeyboardMarkup::new(rows))),
    )
    .await;
}

async fn show_price_list(
    state: &AppState,
    bot: &Bot,
    chat_id: i64,
    message_id: Option<MessageId>,
    city_idx: usize,
) -> crate::error::Result<()> {
    let Some(city) = state.catalog.city(city_idx).await else {
        show_price_list_cities(state, bot, chat_id, message_id).await;
        return Ok(());
    };

    let mut text = format!("💶 Prices in {}:\n", city);
    for district in state.db.list_districts(&city).await? {
        text.push_str(&format!("\n📍 {}\n", district));
        for product_type in state.db.list_types(&city, &district).await? {
            for variant in state.db.list_variants(&city, &district, &product_type).await? {
                text.push_str(&format!(
                    "  {} {} — {} EUR ({} left)\n",
                    product_type,
                    variant.size,
                    format_eur(variant.price),
                    variant.in_stock
                ));
            }
        }
    }

    outbound::edit_or_send(
        bot,
        chat_id,
        message_id,
        &text,
        Some(ReplyMarkup::InlineKeyboard(InlineKeyboardMarkup::new(vec![vec![button(
            "⬅️ Back",
            CallbackAction::PriceList,
        )]]))),
    )
    .await;
    Ok(())
}

async fn show_language_menu(bot: &Bot, chat_id: i64, message_id: Option<MessageId>) {
    let rows: Vec<Vec<InlineKeyboardButton>> = LANGUAGES
        .iter()
        .map(|(tag, label)| {
            vec![button(label, CallbackAction::SetLanguage { lang: (*tag).to_string() })]
        })
        .collect();

    outbound::edit_or_send(
        bot,
        chat_id,
        message_id,
        "Choose your language:",
        Some(ReplyMarkup::InlineKeyboard(InlineKeyboardMarkup::new(rows))),
    )
    .await;
}

// -------------------- helpers --------------------

fn button(label: &str, action: CallbackAction) -> InlineKeyboardButton {
    InlineKeyboardButton::callback(label.to_string(), action.encode())
}

async fn is_banned(state: &AppState, user_id: i64) -> crate::error::Result<bool> {
    Ok(state
        .db
        .get_user(user_id)
        .await?
        .map(|u| u.is_banned)
        .unwrap_or(false))
}
