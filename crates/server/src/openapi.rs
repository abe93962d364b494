use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi, ToSchema};

/// Lazily computed OpenAPI document.
static OPENAPI_JSON: OnceLock<String> = OnceLock::new();

/// Returns the OpenAPI specification as a JSON string.
pub fn openapi_json() -> &'static str {
    OPENAPI_JSON.get_or_init(|| {
        ApiDoc::openapi()
            .to_pretty_json()
            .unwrap_or_else(|_| "{}".to_string())
    })
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "CifraChat Relay API",
        version = "0.1.0",
        description = r#"API REST del relay de chat cifrado. Los mensajes en tiempo real viajan por WebSocket en `/connect`."#
    ),
    servers(
        (url = "http://localhost:3000", description = "Desarrollo local")
    ),
    components(
        schemas(
            ProblemDetails,
            RegisterRequest,
            RegisterResponse,
            LoginRequest,
            LoginResponse,
            UserSummary,
            EncryptRequest,
            EncryptedEnvelope,
            DecryptRequest,
            DecryptResponse,
            EncryptionKeyResponse
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Estado", description = "Diagnóstico del servicio"),
        (name = "Cuentas", description = "Registro e inicio de sesión"),
        (name = "Cifrado", description = "Utilidades de cifrado de sala")
    ),
    paths(
        health_endpoint,
        register_endpoint,
        login_endpoint,
        encrypt_endpoint,
        decrypt_endpoint,
        encryption_key_endpoint
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        let scheme = SecurityScheme::Http(
            HttpBuilder::new()
                .scheme(HttpAuthScheme::Bearer)
                .bearer_format("Session Token")
                .description(Some(
                    "Token de sesión emitido por /api/login; se presenta en el handshake WebSocket de /connect",
                ))
                .build(),
        );
        components.add_security_scheme("BearerAuth", scheme);
    }
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct ProblemDetails {
    #[schema(example = "about:blank")]
    pub r#type: String,
    #[schema(example = "BadRequest")]
    pub title: String,
    #[schema(example = 400)]
    pub status: i32,
    #[schema(nullable = true, example = "Usuario mínimo 2 caracteres")]
    pub detail: Option<String>,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct RegisterRequest {
    #[schema(min_length = 2, example = "ana")]
    pub username: String,
    #[schema(min_length = 4, example = "secreta")]
    pub password: String,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct RegisterResponse {
    #[schema(example = "1f2e3d4c5b6a7988")]
    pub id: String,
    #[schema(example = "ana")]
    pub username: String,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct LoginRequest {
    #[schema(example = "ana")]
    pub username: String,
    #[schema(example = "secreta")]
    pub password: String,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct UserSummary {
    #[schema(example = "1f2e3d4c5b6a7988")]
    pub id: String,
    #[schema(example = "ana")]
    pub username: String,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct LoginResponse {
    #[schema(example = "9c0a…64 caracteres hex")]
    pub token: String,
    pub user: UserSummary,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct EncryptRequest {
    #[schema(example = "hola sala")]
    pub message: String,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct EncryptedEnvelope {
    #[schema(example = "3q2+7w==")]
    pub encrypted: String,
    #[schema(example = "AAECAwQFBgcICQoL")]
    pub iv: String,
    #[serde(rename = "authTag")]
    #[schema(example = "DA4PEBESExQVFhcYGRobHA==")]
    pub auth_tag: String,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct DecryptRequest {
    #[schema(example = "3q2+7w==")]
    pub encrypted: String,
    #[schema(example = "AAECAwQFBgcICQoL")]
    pub iv: String,
    #[serde(rename = "authTag")]
    #[schema(example = "DA4PEBESExQVFhcYGRobHA==")]
    pub auth_tag: String,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct DecryptResponse {
    #[schema(example = "hola sala")]
    pub message: String,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct EncryptionKeyResponse {
    #[schema(example = "MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY=")]
    pub key: String,
}

// Note: These functions are markers for OpenAPI generation and are not called directly
#[allow(dead_code)]
#[utoipa::path(
    get,
    path = "/api/health",
    tag = "Estado",
    responses(
        (status = 200, description = "Saludo del servicio", body = String, content_type = "text/plain")
    )
)]
pub fn health_endpoint() {}

#[allow(dead_code)]
#[utoipa::path(
    post,
    path = "/api/register",
    tag = "Cuentas",
    request_body(content = RegisterRequest, content_type = "application/json"),
    responses(
        (status = 201, description = "Cuenta creada", body = RegisterResponse),
        (status = 400, description = "Credenciales inválidas", body = ProblemDetails, content_type = "application/problem+json"),
        (status = 409, description = "Usuario ya existe", body = ProblemDetails, content_type = "application/problem+json")
    )
)]
pub fn register_endpoint() {}

#[allow(dead_code)]
#[utoipa::path(
    post,
    path = "/api/login",
    tag = "Cuentas",
    request_body(content = LoginRequest, content_type = "application/json"),
    responses(
        (status = 200, description = "Sesión emitida", body = LoginResponse),
        (status = 401, description = "Credenciales rechazadas", body = ProblemDetails, content_type = "application/problem+json")
    )
)]
pub fn login_endpoint() {}

#[allow(dead_code)]
#[utoipa::path(
    post,
    path = "/api/encrypt",
    tag = "Cifrado",
    request_body(content = EncryptRequest, content_type = "application/json"),
    responses(
        (status = 200, description = "Mensaje cifrado con la clave de sala", body = EncryptedEnvelope),
        (status = 400, description = "Petición inválida", body = ProblemDetails, content_type = "application/problem+json")
    )
)]
pub fn encrypt_endpoint() {}

#[allow(dead_code)]
#[utoipa::path(
    post,
    path = "/api/decrypt",
    tag = "Cifrado",
    request_body(content = DecryptRequest, content_type = "application/json"),
    responses(
        (status = 200, description = "Mensaje descifrado", body = DecryptResponse),
        (status = 400, description = "Petición inválida", body = ProblemDetails, content_type = "application/problem+json"),
        (status = 500, description = "Sobre rechazado", body = ProblemDetails, content_type = "application/problem+json")
    )
)]
pub fn decrypt_endpoint() {}

#[allow(dead_code)]
#[utoipa::path(
    get,
    path = "/api/encryption-key",
    tag = "Cifrado",
    responses(
        (status = 200, description = "Clave de sala en base64", body = EncryptionKeyResponse)
    )
)]
pub fn encryption_key_endpoint() {}
