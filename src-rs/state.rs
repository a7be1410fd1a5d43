use std::sync::Arc;

use crate::{
    auth::AuthService, browser::BrowserClient, config::Config, google_oauth::GoogleOAuthClient,
    places::PlacesClient, plans::PriceMap, store::StoreClient, stripe_api::StripeApi,
    web_push::WebPushSender,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: StoreClient,
    pub auth: AuthService,
    pub stripe: StripeApi,
    pub price_map: PriceMap,
    pub google: GoogleOAuthClient,
    pub places: PlacesClient,
    pub push: WebPushSender,
    pub browser: BrowserClient,
}

impl AppState {
    /// Builds every downstream client from `config`. No network I/O happens
    /// here.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let store = StoreClient::new(&config.supabase_url, &config.supabase_service_key)?;
        let auth = AuthService::new(&config.supabase_url, &config.supabase_service_key)?;
        let stripe = StripeApi::new(
            config.stripe_secret_key.clone(),
            config.stripe_webhook_secret.clone(),
        )?;
        let google = GoogleOAuthClient::new(
            config.google_client_id.clone(),
            config.google_client_secret.clone(),
            config.google_redirect_uri.clone(),
        )?;
        let places = PlacesClient::new(config.google_places_api_key.clone())?;
        let push = WebPushSender::new(
            config.vapid_public_key.as_deref(),
            config.vapid_private_key.as_deref(),
            config.vapid_subject.clone(),
        )?;
        let browser =
            BrowserClient::new(config.browserless_url.clone(), config.browserless_token.clone())?;
        let price_map = PriceMap::from_config(&config);

        Ok(Self {
            config: Arc::new(config),
            store,
            auth,
            stripe,
            price_map,
            google,
            places,
            push,
            browser,
        })
    }
}
